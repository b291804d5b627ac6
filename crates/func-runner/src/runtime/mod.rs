//! Runtime module - plugin installation and request lifecycle
//!
//! This module provides:
//! - Operation and service vendor registries
//! - The plugin loader and the dynamic-library module loader
//! - Request contexts with per-request resource accumulation
//! - The lifecycle coordinator that ties them together

pub mod accumulator;
pub mod context;
pub mod dylib;
pub mod guard;
pub mod lifecycle;
pub mod loader;
pub mod operations;
pub mod services;

pub use accumulator::{Accumulator, ReleaseReport};
pub use context::{RequestContext, RequestId};
pub use dylib::DylibLoader;
pub use lifecycle::{EndOfLifeReport, FuncRunner, ProcessState, RunnerError, CONTEXT_VERSION};
pub use loader::{LayeredLoader, LoadReport, PluginLoader};
pub use operations::OperationRegistry;
pub use services::ServiceRegistry;
