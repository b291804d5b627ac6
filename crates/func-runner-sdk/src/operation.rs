//! Operations and the installers that contribute them
//!
//! An operation is a named callable the runner dispatches requests into. Each
//! bundle ships one or more [`OperationInstaller`]s; at load time the runner
//! calls every installer with an [`OperationHost`] through which it adds
//! operations and end-of-life callbacks.
//!
//! # Example
//!
//! ```ignore
//! use func_runner_sdk::prelude::*;
//!
//! struct PetInstaller;
//!
//! impl OperationInstaller for PetInstaller {
//!     fn install_operations(&self, host: &dyn OperationHost) -> Result<(), FuncError> {
//!         host.add_operation("getPet", operation(|ctx| {
//!             Ok(json!({"id": ctx.path_params().get("id")}))
//!         }));
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::Span;

use crate::context::Context;
use crate::error::FuncError;
use crate::loader::ModuleLoader;

/// A named unit of request handling
pub type Operation = Arc<dyn Fn(&dyn Context) -> Result<Value, FuncError> + Send + Sync>;

/// A process-shutdown hook, run at most once
pub type EndOfLife = Box<dyn FnOnce(&Span) -> Result<(), FuncError> + Send>;

/// Wrap a closure as an [`Operation`]
pub fn operation<F>(f: F) -> Operation
where
    F: Fn(&dyn Context) -> Result<Value, FuncError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as an [`EndOfLife`] callback
pub fn end_of_life<F>(f: F) -> EndOfLife
where
    F: FnOnce(&Span) -> Result<(), FuncError> + Send + 'static,
{
    Box::new(f)
}

/// Capabilities the runner lends to an installer while it runs
pub trait OperationHost {
    /// Register (or replace) the operation called `name`
    fn add_operation(&self, name: &str, op: Operation);

    /// An already registered operation, e.g. to wrap it
    fn get_operation(&self, name: &str) -> Option<Operation>;

    /// Run `callback` when the process reaches end-of-life
    fn add_end_of_life(&self, callback: EndOfLife);

    /// The effective module loader of this load
    fn loader(&self) -> Arc<dyn ModuleLoader>;

    fn logger(&self) -> &Span;
}

/// Contributes operations to the runner
pub trait OperationInstaller: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Providers are applied in ascending order
    fn order(&self) -> i32 {
        0
    }

    fn install_operations(&self, host: &dyn OperationHost) -> Result<(), FuncError>;
}
