//! Operation registry
//!
//! Concurrent name → operation table. Installs happen while bundles load
//! (and again on reload) while requests read it, so every entry is replaced
//! atomically and lookups hand out a cloned `Arc` rather than a map guard.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use func_runner_sdk::Operation;

/// Names of the control operations every runner carries
pub mod builtin {
    /// List all operation names
    pub const OPERATIONS: &str = "operations";
    /// Run full end-of-life teardown
    pub const END_LIFE: &str = "endLife";
    /// Describe the effective module loader
    pub const GET_CLASSLOADER: &str = "getClassloader";
}

/// Registry of installed operations
#[derive(Default)]
pub struct OperationRegistry {
    operations: DashMap<String, Operation>,
}

impl OperationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `op` under `name`, replacing (and returning) any previous entry
    pub fn install(&self, name: &str, op: Operation) -> Option<Operation> {
        let previous = self.operations.insert(name.to_string(), op);
        tracing::debug!(operation = %name, replaced = previous.is_some(), "Installed operation");
        previous
    }

    /// Get an operation by name
    pub fn lookup(&self, name: &str) -> Option<Operation> {
        self.operations.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Check if an operation is installed
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// All installed names, sorted
    pub fn names(&self) -> BTreeSet<String> {
        self.operations.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}
