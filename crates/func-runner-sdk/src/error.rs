//! Error types shared by the runner and Func Bundles

use thiserror::Error;

/// Errors raised by operations, service vendors and other bundle code
#[derive(Error, Debug)]
pub enum FuncError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service '{service}' vends {actual}, not {expected}")]
    TypeMismatch {
        service: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Operation failed: {0}")]
    Operation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FuncError {
    /// Shorthand for an operation failure with a message
    pub fn operation(msg: impl Into<String>) -> Self {
        FuncError::Operation(msg.into())
    }

    /// Shorthand for a resource failure with a message
    pub fn resource(msg: impl Into<String>) -> Self {
        FuncError::Resource(msg.into())
    }
}

/// Errors raised when a module loader cannot enumerate its providers.
///
/// Unlike [`FuncError`], these abort the whole load: a loader that cannot list
/// its providers means the bundle itself is broken.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to load library {path}: {reason}")]
    Library { path: String, reason: String },

    #[error("Failed to find symbol {symbol}: {reason}")]
    Symbol { symbol: String, reason: String },

    #[error("Malformed provider declaration: {0}")]
    Provider(String),

    #[error("Loader extension failed: {0}")]
    Extension(#[source] FuncError),
}
