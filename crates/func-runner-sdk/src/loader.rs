//! Module loaders and provider discovery
//!
//! A [`ModuleLoader`] is the runner's view of a bundle: it enumerates the
//! providers the bundle contributes. Loader extensions may wrap the loader
//! before anything else is discovered, which is how a bundle pulls in extra
//! libraries ahead of its own operations.
//!
//! A bundle compiled as a dynamic library exports its providers with
//! [`export_bundle!`](crate::export_bundle):
//!
//! ```ignore
//! use func_runner_sdk::prelude::*;
//!
//! export_bundle!(Bundle::new("pets").with_installer(PetInstaller));
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{DiscoveryError, FuncError};
use crate::operation::OperationInstaller;
use crate::vendor::ServiceVendorBuilder;

/// Enumerates the providers visible through one loader
pub trait ModuleLoader: Send + Sync {
    /// Description reported by the `getClassloader` control operation
    fn describe(&self) -> Value;

    fn loader_extensions(&self) -> Result<Vec<Arc<dyn LoaderExtension>>, DiscoveryError>;

    fn operation_installers(&self) -> Result<Vec<Arc<dyn OperationInstaller>>, DiscoveryError>;

    fn vendor_builders(&self) -> Result<Vec<Arc<dyn ServiceVendorBuilder>>, DiscoveryError>;
}

/// Wraps or extends the effective loader
pub trait LoaderExtension: Send + Sync {
    /// Providers are applied in ascending order
    fn order(&self) -> i32 {
        0
    }

    fn build_from(&self, parent: Arc<dyn ModuleLoader>) -> Result<Arc<dyn ModuleLoader>, FuncError>;
}

/// The set of providers one bundle contributes
///
/// `Bundle` is itself a [`ModuleLoader`], which makes it the loader of choice
/// for bundles linked into the host and for tests.
#[derive(Clone, Default)]
pub struct Bundle {
    pub name: String,
    pub loader_extensions: Vec<Arc<dyn LoaderExtension>>,
    pub operation_installers: Vec<Arc<dyn OperationInstaller>>,
    pub vendor_builders: Vec<Arc<dyn ServiceVendorBuilder>>,
}

impl Bundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder pattern: add a loader extension
    pub fn with_extension(mut self, extension: impl LoaderExtension + 'static) -> Self {
        self.loader_extensions.push(Arc::new(extension));
        self
    }

    /// Builder pattern: add an operation installer
    pub fn with_installer(mut self, installer: impl OperationInstaller + 'static) -> Self {
        self.operation_installers.push(Arc::new(installer));
        self
    }

    /// Builder pattern: add a vendor builder
    pub fn with_builder(mut self, builder: impl ServiceVendorBuilder + 'static) -> Self {
        self.vendor_builders.push(Arc::new(builder));
        self
    }
}

impl ModuleLoader for Bundle {
    fn describe(&self) -> Value {
        json!({
            "kind": "bundle",
            "name": self.name,
            "loader_extensions": self.loader_extensions.len(),
            "operation_installers": self.operation_installers.len(),
            "vendor_builders": self.vendor_builders.len(),
        })
    }

    fn loader_extensions(&self) -> Result<Vec<Arc<dyn LoaderExtension>>, DiscoveryError> {
        Ok(self.loader_extensions.clone())
    }

    fn operation_installers(&self) -> Result<Vec<Arc<dyn OperationInstaller>>, DiscoveryError> {
        Ok(self.operation_installers.clone())
    }

    fn vendor_builders(&self) -> Result<Vec<Arc<dyn ServiceVendorBuilder>>, DiscoveryError> {
        Ok(self.vendor_builders.clone())
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("name", &self.name)
            .field("loader_extensions", &self.loader_extensions.len())
            .field("operation_installers", &self.operation_installers.len())
            .field("vendor_builders", &self.vendor_builders.len())
            .finish()
    }
}

/// Signature of the entry point a bundle library exports.
///
/// The returned pointer comes from `Box::into_raw` and is owned by the caller.
pub type BundleEntryFn = unsafe extern "C" fn() -> *mut Bundle;

/// Name of the exported entry point symbol
pub const BUNDLE_ENTRY_SYMBOL: &[u8] = b"func_bundle_entry";

/// Signature of the hook that routes a bundle's tracing to the host.
///
/// A `cdylib` links its own copy of `tracing-core`, so events a bundle emits
/// go to that copy's dispatcher. The host calls this hook with its own
/// dispatcher before asking for the bundle.
pub type BundleTracingFn = unsafe extern "C" fn(&tracing::Dispatch);

/// Name of the exported tracing hook symbol
pub const BUNDLE_TRACING_SYMBOL: &[u8] = b"func_bundle_attach_tracing";

#[doc(hidden)]
pub mod __private {
    pub use tracing;
}

/// Export a [`Bundle`] from a `cdylib` crate
///
/// The host and the bundle must be built with the same compiler and the same
/// SDK version; trait objects cross the library boundary unchanged.
///
/// Besides the entry point this exports the tracing hook described at
/// [`BundleTracingFn`]. Until a host calls it, the bundle's `tracing` events
/// have no subscriber and are dropped, even inside a host span.
#[macro_export]
macro_rules! export_bundle {
    ($bundle:expr) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn func_bundle_entry() -> *mut $crate::Bundle {
            let bundle: $crate::Bundle = $bundle;
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(bundle))
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn func_bundle_attach_tracing(dispatch: &$crate::loader::__private::tracing::Dispatch) {
            // Only the first call takes; a library opened twice is mapped once
            let _ = $crate::loader::__private::tracing::dispatcher::set_global_default(dispatch.clone());
        }
    };
}
