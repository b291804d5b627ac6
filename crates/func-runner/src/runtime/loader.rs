//! Plugin loader
//!
//! Installs a bundle into the runner in four steps:
//!
//! 1. fold the loader extensions discovered from the base loader into the
//!    effective loader;
//! 2. run every operation installer visible through the effective loader;
//! 3. collect the vendor builders by type, on top of the built-in pool builder;
//! 4. build a vendor for every service declared in the bootstrap properties.
//!
//! Only a loader that cannot enumerate its providers (or an extension that
//! cannot produce a loader) stops the load. Every other plugin failure is
//! logged and skipped.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::Span;

use func_runner_sdk::{
    DiscoveryError, EndOfLife, LoaderExtension, ModuleLoader, Operation, OperationHost,
    OperationInstaller, Params, ServiceVendorBuilder,
};

use super::guard::contain;
use super::lifecycle::EndOfLifeQueue;
use super::operations::OperationRegistry;
use super::services::{PooledConnectionBuilder, ServiceRegistry, POOLED_CONNECTION_TYPE};

/// What a load installed
#[derive(Clone)]
pub struct LoadReport {
    /// The effective loader after all extensions were applied
    pub loader: Arc<dyn ModuleLoader>,
    /// Installers that completed
    pub installers: usize,
    /// Installers that failed and were skipped
    pub installer_failures: usize,
    /// Services that got a vendor, in property order
    pub vendors: Vec<String>,
    /// Builders that failed and were skipped
    pub builder_failures: usize,
}

impl std::fmt::Debug for LoadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadReport")
            .field("loader", &self.loader.describe())
            .field("installers", &self.installers)
            .field("installer_failures", &self.installer_failures)
            .field("vendors", &self.vendors)
            .field("builder_failures", &self.builder_failures)
            .finish()
    }
}

/// Installs bundles into a pair of registries
pub struct PluginLoader<'a> {
    operations: &'a OperationRegistry,
    services: &'a ServiceRegistry,
    end_of_life: &'a EndOfLifeQueue,
}

impl<'a> PluginLoader<'a> {
    pub fn new(
        operations: &'a OperationRegistry,
        services: &'a ServiceRegistry,
        end_of_life: &'a EndOfLifeQueue,
    ) -> Self {
        Self {
            operations,
            services,
            end_of_life,
        }
    }

    /// Load everything `base` provides, configured by `properties`
    pub fn load(
        &self,
        properties: &Params,
        base: Arc<dyn ModuleLoader>,
        logger: &Span,
    ) -> Result<LoadReport, DiscoveryError> {
        logger.in_scope(|| {
            let loader = apply_extensions(base)?;
            let (installers, installer_failures) = self.install_operations(&loader, logger)?;
            let builders = collect_builders(loader.as_ref())?;
            let (vendors, builder_failures) = self.build_vendors(properties, &builders, logger);

            tracing::info!(
                installers,
                installer_failures,
                vendors = vendors.len(),
                builder_failures,
                "Bundle loaded"
            );

            Ok(LoadReport {
                loader,
                installers,
                installer_failures,
                vendors,
                builder_failures,
            })
        })
    }

    fn install_operations(
        &self,
        loader: &Arc<dyn ModuleLoader>,
        logger: &Span,
    ) -> Result<(usize, usize), DiscoveryError> {
        let installers = ordered(loader.operation_installers()?, |installer| installer.order());

        let mut installed = 0;
        let mut failed = 0;
        for installer in installers {
            let host = InstallHost::new(self.operations, loader, logger);
            match contain(|| installer.install_operations(&host)) {
                Ok(()) => {
                    let (operations, callbacks) = host.commit(self.operations, self.end_of_life);
                    tracing::debug!(installer = installer.name(), operations, callbacks, "Installed operations");
                    installed += 1;
                }
                Err(failure) => {
                    tracing::warn!(installer = installer.name(), error = %failure, "Operation installer failed, skipping it");
                    failed += 1;
                }
            }
        }
        Ok((installed, failed))
    }

    fn build_vendors(
        &self,
        properties: &Params,
        builders: &HashMap<String, Arc<dyn ServiceVendorBuilder>>,
        logger: &Span,
    ) -> (Vec<String>, usize) {
        let mut vendors = Vec::new();
        let mut failed = 0;

        for (name, value) in properties {
            let Some(config) = value.as_object() else {
                continue;
            };
            let Some(kind) = config.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(builder) = builders.get(kind) else {
                tracing::trace!(service = %name, kind, "No vendor builder for service type");
                continue;
            };

            match contain(|| builder.build_vendor(name, config, logger)) {
                Ok(Some(vendor)) => {
                    self.services.register(name, vendor);
                    vendors.push(name.clone());
                }
                Ok(None) => {
                    tracing::debug!(service = %name, kind, "Vendor builder declined service");
                }
                Err(failure) => {
                    tracing::warn!(service = %name, kind, error = %failure, "Failed to build service vendor");
                    failed += 1;
                }
            }
        }
        (vendors, failed)
    }
}

/// Stable sort by provider order; equal orders keep discovery order
fn ordered<P: ?Sized>(mut providers: Vec<Arc<P>>, order: impl Fn(&P) -> i32) -> Vec<Arc<P>> {
    providers.sort_by_key(|provider| order(provider));
    providers
}

fn apply_extensions(base: Arc<dyn ModuleLoader>) -> Result<Arc<dyn ModuleLoader>, DiscoveryError> {
    let extensions = ordered(base.loader_extensions()?, |extension| extension.order());

    let mut loader = base;
    for extension in extensions {
        let parent = Arc::clone(&loader);
        loader = contain(|| extension.build_from(parent)).map_err(|failure| {
            tracing::error!(error = %failure, "Loader extension failed");
            DiscoveryError::Extension(failure.into())
        })?;
    }
    Ok(loader)
}

fn collect_builders(
    loader: &dyn ModuleLoader,
) -> Result<HashMap<String, Arc<dyn ServiceVendorBuilder>>, DiscoveryError> {
    let mut builders: HashMap<String, Arc<dyn ServiceVendorBuilder>> = HashMap::new();
    builders.insert(POOLED_CONNECTION_TYPE.to_string(), Arc::new(PooledConnectionBuilder));

    let discovered = ordered(loader.vendor_builders()?, |builder| builder.order());
    for builder in discovered {
        let kind = builder.for_type().to_string();
        if builders.insert(kind.clone(), builder).is_some() {
            tracing::debug!(kind = %kind, "Vendor builder overrides an earlier one");
        }
    }
    Ok(builders)
}

/// Capabilities handed to one installer
///
/// Contributions are staged and only reach the registries once the installer
/// returns successfully, so a failing installer leaves nothing behind.
struct InstallHost<'a> {
    registry: &'a OperationRegistry,
    loader: &'a Arc<dyn ModuleLoader>,
    logger: &'a Span,
    operations: RefCell<Vec<(String, Operation)>>,
    callbacks: RefCell<Vec<EndOfLife>>,
}

impl<'a> InstallHost<'a> {
    fn new(registry: &'a OperationRegistry, loader: &'a Arc<dyn ModuleLoader>, logger: &'a Span) -> Self {
        Self {
            registry,
            loader,
            logger,
            operations: RefCell::new(Vec::new()),
            callbacks: RefCell::new(Vec::new()),
        }
    }

    fn commit(self, registry: &OperationRegistry, end_of_life: &EndOfLifeQueue) -> (usize, usize) {
        let operations = self.operations.into_inner();
        let callbacks = self.callbacks.into_inner();
        let counts = (operations.len(), callbacks.len());

        for (name, op) in operations {
            registry.install(&name, op);
        }
        for callback in callbacks {
            end_of_life.push(callback);
        }
        counts
    }
}

impl OperationHost for InstallHost<'_> {
    fn add_operation(&self, name: &str, op: Operation) {
        self.operations.borrow_mut().push((name.to_string(), op));
    }

    fn get_operation(&self, name: &str) -> Option<Operation> {
        let staged = self
            .operations
            .borrow()
            .iter()
            .rev()
            .find(|(staged, _)| staged == name)
            .map(|(_, op)| Arc::clone(op));
        staged.or_else(|| self.registry.lookup(name))
    }

    fn add_end_of_life(&self, callback: EndOfLife) {
        self.callbacks.borrow_mut().push(callback);
    }

    fn loader(&self) -> Arc<dyn ModuleLoader> {
        Arc::clone(self.loader)
    }

    fn logger(&self) -> &Span {
        self.logger
    }
}

/// A loader followed by extra layers
///
/// Discovery returns the parent's providers first, then each layer's. Loader
/// extensions typically return one of these to add providers to a bundle.
pub struct LayeredLoader {
    parent: Arc<dyn ModuleLoader>,
    layers: Vec<Arc<dyn ModuleLoader>>,
}

impl LayeredLoader {
    pub fn new(parent: Arc<dyn ModuleLoader>) -> Self {
        Self {
            parent,
            layers: Vec::new(),
        }
    }

    /// Builder pattern: add a layer
    pub fn with_layer(mut self, layer: Arc<dyn ModuleLoader>) -> Self {
        self.layers.push(layer);
        self
    }

    fn collect<P: ?Sized>(
        &self,
        discover: impl Fn(&dyn ModuleLoader) -> Result<Vec<Arc<P>>, DiscoveryError>,
    ) -> Result<Vec<Arc<P>>, DiscoveryError> {
        let mut providers = discover(self.parent.as_ref())?;
        for layer in &self.layers {
            providers.extend(discover(layer.as_ref())?);
        }
        Ok(providers)
    }
}

impl ModuleLoader for LayeredLoader {
    fn describe(&self) -> Value {
        let layers: Vec<Value> = self.layers.iter().map(|layer| layer.describe()).collect();
        json!({
            "kind": "layered",
            "parent": self.parent.describe(),
            "layers": layers,
        })
    }

    fn loader_extensions(&self) -> Result<Vec<Arc<dyn LoaderExtension>>, DiscoveryError> {
        self.collect(|loader| loader.loader_extensions())
    }

    fn operation_installers(&self) -> Result<Vec<Arc<dyn OperationInstaller>>, DiscoveryError> {
        self.collect(|loader| loader.operation_installers())
    }

    fn vendor_builders(&self) -> Result<Vec<Arc<dyn ServiceVendorBuilder>>, DiscoveryError> {
        self.collect(|loader| loader.vendor_builders())
    }
}
