//! Failure boundary around calls into bundle code
//!
//! Installers, builders, vendors and end-of-life callbacks are third-party
//! code. Whatever they do (return an error or panic) must stay local to the
//! call so the runner can log it and move on to the next plugin.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use func_runner_sdk::FuncError;

/// Why a call into bundle code did not succeed
#[derive(Debug, thiserror::Error)]
pub enum PluginFailure {
    #[error(transparent)]
    Error(#[from] FuncError),

    #[error("panicked: {0}")]
    Panic(String),
}

impl From<PluginFailure> for FuncError {
    fn from(failure: PluginFailure) -> Self {
        match failure {
            PluginFailure::Error(err) => err,
            PluginFailure::Panic(msg) => FuncError::Internal(format!("panicked: {msg}")),
        }
    }
}

/// Run `f`, turning both its error and a panic into a [`PluginFailure`]
pub fn contain<T>(f: impl FnOnce() -> Result<T, FuncError>) -> Result<T, PluginFailure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(PluginFailure::from),
        Err(payload) => Err(PluginFailure::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
