//! Func Runner - loads Func Bundles and runs their operations
//!
//! Bundles contribute operations, service vendors and module-loader
//! extensions; the runner installs them, hands each request a context and
//! releases whatever the request vended once it completes.

pub mod config;
pub mod runtime;

pub use func_runner_sdk as sdk;
pub use runtime::{
    DylibLoader, EndOfLifeReport, FuncRunner, LayeredLoader, LoadReport, RequestContext,
    RunnerError, CONTEXT_VERSION,
};
