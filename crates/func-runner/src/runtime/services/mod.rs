//! Service vendor registry
//!
//! Vendors are built once per configured service while bundles load and live
//! until end-of-life. The registry stores them type-erased; callers recover
//! the typed vendor with [`AnyVendor::downcast`]. A vendor replaced by a
//! reload is retired rather than dropped: requests in flight may still hand
//! items back to it, and it is ended with the others.

pub mod pool;

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use func_runner_sdk::AnyVendor;

pub use pool::{ConnectionPool, PoolConfig, PooledConnection, PooledConnectionBuilder, POOLED_CONNECTION_TYPE};

/// Registry of named service vendors
#[derive(Default)]
pub struct ServiceRegistry {
    vendors: DashMap<String, AnyVendor>,
    retired: Mutex<Vec<(String, AnyVendor)>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vendor, retiring any vendor already under `name`
    ///
    /// Returns whether a vendor was replaced.
    pub fn register(&self, name: &str, vendor: AnyVendor) -> bool {
        tracing::debug!(service = %name, item = vendor.item_type(), "Registered service vendor");
        match self.vendors.insert(name.to_string(), vendor) {
            Some(replaced) => {
                tracing::debug!(service = %name, "Retired replaced service vendor");
                self.retired().push((name.to_string(), replaced));
                true
            }
            None => false,
        }
    }

    /// Get a vendor by name
    pub fn lookup(&self, name: &str) -> Option<AnyVendor> {
        self.vendors.get(name).map(|entry| entry.value().clone())
    }

    /// All registered names, sorted
    pub fn names(&self) -> BTreeSet<String> {
        self.vendors.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }

    /// Vendors replaced since the last drain
    pub fn retired_count(&self) -> usize {
        self.retired().len()
    }

    /// Remove every vendor: retired ones in retirement order, then the
    /// registered ones in name order
    pub fn drain(&self) -> Vec<(String, AnyVendor)> {
        let mut drained = std::mem::take(&mut *self.retired());
        drained.extend(
            self.names()
                .into_iter()
                .filter_map(|name| self.vendors.remove(&name)),
        );
        drained
    }

    fn retired(&self) -> MutexGuard<'_, Vec<(String, AnyVendor)>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}
