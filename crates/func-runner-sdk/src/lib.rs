//! Func Runner SDK - Types and traits for writing Func Bundles
//!
//! A Func Bundle contributes operations, service vendors and module-loader
//! extensions to a running Func Runner. This crate defines those provider
//! contracts and the request context that operations receive.

pub mod context;
pub mod error;
pub mod loader;
pub mod operation;
pub mod vendor;

pub mod prelude {
    //! Common imports for Func Bundles
    pub use crate::context::{Context, Params};
    pub use crate::error::{DiscoveryError, FuncError};
    pub use crate::export_bundle;
    pub use crate::loader::{Bundle, LoaderExtension, ModuleLoader};
    pub use crate::operation::{
        end_of_life, operation, EndOfLife, Operation, OperationHost, OperationInstaller,
    };
    pub use crate::vendor::{AnyVendor, ServiceVendor, ServiceVendorBuilder};
    pub use serde_json::{json, Value};
    pub use tracing::Span;
}

// Re-export key types at crate root
pub use context::{Context, Params};
pub use error::{DiscoveryError, FuncError};
pub use loader::{
    Bundle, BundleEntryFn, BundleTracingFn, LoaderExtension, ModuleLoader, BUNDLE_ENTRY_SYMBOL,
    BUNDLE_TRACING_SYMBOL,
};
pub use operation::{EndOfLife, Operation, OperationHost, OperationInstaller};
pub use vendor::{AnyVendor, Releasable, ReleasePair, ServiceVendor, ServiceVendorBuilder};
