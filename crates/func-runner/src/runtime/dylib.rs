//! Dynamic bundle loading
//!
//! Opens a Func Bundle compiled as a `cdylib` and exposes the providers it
//! exports through [`ModuleLoader`]. The bundle crate declares its providers
//! with `export_bundle!`, which produces the `func_bundle_entry` symbol and
//! the hook that points the library's tracing at the host's dispatcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libloading::{Library, Symbol};
use serde_json::{json, Value};

use func_runner_sdk::{
    Bundle, BundleEntryFn, BundleTracingFn, DiscoveryError, LoaderExtension, ModuleLoader,
    OperationInstaller, ServiceVendorBuilder, BUNDLE_ENTRY_SYMBOL, BUNDLE_TRACING_SYMBOL,
};

/// A bundle loaded from a dynamic library
pub struct DylibLoader {
    /// Providers exported by the library. Declared before the library so
    /// they are dropped while its code is still mapped.
    bundle: Bundle,

    /// The loaded library (must stay alive while any provider is in use)
    _library: Library,

    /// Path the library was loaded from
    pub path: PathBuf,

    /// When the library was loaded
    pub loaded_at: DateTime<Utc>,
}

impl DylibLoader {
    /// Load a bundle from a dynamic library
    ///
    /// # Safety
    /// This function loads and executes code from a dynamic library. The
    /// library must export `func_bundle_entry` with the [`BundleEntryFn`]
    /// signature and be built with the same compiler and SDK as the runner.
    /// Operations and vendors obtained from it must not outlive the loader.
    pub unsafe fn open(path: &Path) -> Result<Self, DiscoveryError> {
        let library = Library::new(path).map_err(|e| DiscoveryError::Library {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        match library.get::<BundleTracingFn>(BUNDLE_TRACING_SYMBOL) {
            Ok(attach) => tracing::dispatcher::get_default(|dispatch| attach(dispatch)),
            Err(_) => tracing::debug!(path = %path.display(), "Bundle library has no tracing hook"),
        }

        let raw = {
            let entry: Symbol<BundleEntryFn> =
                library
                    .get(BUNDLE_ENTRY_SYMBOL)
                    .map_err(|e| DiscoveryError::Symbol {
                        symbol: String::from_utf8_lossy(BUNDLE_ENTRY_SYMBOL).into_owned(),
                        reason: e.to_string(),
                    })?;
            entry()
        };
        if raw.is_null() {
            return Err(DiscoveryError::Provider(format!(
                "{} returned no bundle",
                path.display()
            )));
        }
        let bundle = *Box::from_raw(raw);

        tracing::info!(path = %path.display(), bundle = %bundle.name, "Loaded bundle library");

        Ok(Self {
            bundle,
            _library: library,
            path: path.to_path_buf(),
            loaded_at: Utc::now(),
        })
    }

    /// Load the bundle called `name` from `dir`, using the platform's
    /// library file naming
    ///
    /// # Safety
    /// See [`DylibLoader::open`].
    pub unsafe fn open_in(dir: &Path, name: &str) -> Result<Self, DiscoveryError> {
        Self::open(&dir.join(library_file_name(name)))
    }

    /// Name the bundle gave itself
    pub fn name(&self) -> &str {
        &self.bundle.name
    }

    /// Wrap in an `Arc` for use as a base loader
    pub fn into_loader(self) -> Arc<dyn ModuleLoader> {
        Arc::new(self)
    }
}

impl ModuleLoader for DylibLoader {
    fn describe(&self) -> Value {
        json!({
            "kind": "dylib",
            "path": self.path.display().to_string(),
            "loaded_at": self.loaded_at.to_rfc3339(),
            "bundle": self.bundle.describe(),
        })
    }

    fn loader_extensions(&self) -> Result<Vec<Arc<dyn LoaderExtension>>, DiscoveryError> {
        self.bundle.loader_extensions()
    }

    fn operation_installers(&self) -> Result<Vec<Arc<dyn OperationInstaller>>, DiscoveryError> {
        self.bundle.operation_installers()
    }

    fn vendor_builders(&self) -> Result<Vec<Arc<dyn ServiceVendorBuilder>>, DiscoveryError> {
        self.bundle.vendor_builders()
    }
}

impl std::fmt::Debug for DylibLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DylibLoader")
            .field("path", &self.path)
            .field("loaded_at", &self.loaded_at)
            .field("bundle", &self.bundle)
            .finish()
    }
}

/// Platform file name of the library a bundle crate called `name` builds
#[cfg(target_os = "windows")]
pub fn library_file_name(name: &str) -> String {
    format!("{}.dll", name.replace('-', "_"))
}

#[cfg(target_os = "macos")]
pub fn library_file_name(name: &str) -> String {
    format!("lib{}.dylib", name.replace('-', "_"))
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub fn library_file_name(name: &str) -> String {
    format!("lib{}.so", name.replace('-', "_"))
}
