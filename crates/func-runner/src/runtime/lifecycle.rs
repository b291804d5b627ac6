//! Lifecycle coordinator
//!
//! [`FuncRunner`] owns the process-wide registries, drives bundle loading
//! (start and reload), hands out request contexts, dispatches requests and
//! runs end-of-life teardown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::Span;

use func_runner_sdk::operation::operation;
use func_runner_sdk::{Bundle, Context, DiscoveryError, EndOfLife, FuncError, ModuleLoader, Operation, Params};

use super::context::{RequestContext, RequestId};
use super::guard::{contain, PluginFailure};
use super::loader::{LoadReport, PluginLoader};
use super::operations::{builtin, OperationRegistry};
use super::services::ServiceRegistry;

/// Version of the context protocol bundles are written against
pub const CONTEXT_VERSION: &str = "1";

/// Errors surfaced to whoever drives the runner
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Bundle discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation '{name}' failed: {source}")]
    Operation {
        name: String,
        #[source]
        source: FuncError,
    },

    #[error("Operation '{name}' panicked: {message}")]
    OperationPanicked { name: String, message: String },
}

/// Snapshot published by each successful load
pub struct ProcessState {
    /// Bootstrap properties the bundle was loaded with
    pub properties: Params,
    /// Effective module loader after extensions
    pub loader: Arc<dyn ModuleLoader>,
    /// `None` until the first load
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ProcessState {
    fn empty() -> Self {
        Self {
            properties: Params::new(),
            loader: Arc::new(Bundle::new("empty")),
            loaded_at: None,
        }
    }
}

impl std::fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessState")
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("loader", &self.loader.describe())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// End-of-life callbacks in registration order
#[derive(Default)]
pub struct EndOfLifeQueue {
    callbacks: Mutex<Vec<EndOfLife>>,
}

impl EndOfLifeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, callback: EndOfLife) {
        self.callbacks().push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks().is_empty()
    }

    /// Take every queued callback, leaving the queue empty
    pub fn drain(&self) -> Vec<EndOfLife> {
        std::mem::take(&mut *self.callbacks())
    }

    fn callbacks(&self) -> MutexGuard<'_, Vec<EndOfLife>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of end-of-life teardown
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndOfLifeReport {
    /// Vendors whose end-of-life was run
    pub vendors: usize,
    pub vendor_failures: usize,
    /// Callbacks that were run
    pub callbacks: usize,
    pub callback_failures: usize,
}

struct Shared {
    operations: Arc<OperationRegistry>,
    services: Arc<ServiceRegistry>,
    end_of_life: EndOfLifeQueue,
    state: ArcSwap<ProcessState>,
    load_lock: Mutex<()>,
    /// Every loader a load installed from. Registered operations, vendors and
    /// callbacks may run code owned by any of them, so they are kept until the
    /// runner itself is dropped. Declared last so the registries go first.
    loaders: Mutex<Vec<Arc<dyn ModuleLoader>>>,
}

impl Shared {
    fn retain(&self, loader: Arc<dyn ModuleLoader>) {
        let mut loaders = self.loaders.lock().unwrap_or_else(PoisonError::into_inner);
        if !loaders.iter().any(|kept| Arc::ptr_eq(kept, &loader)) {
            loaders.push(loader);
        }
    }
}

/// The Func Runner
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct FuncRunner {
    inner: Arc<Shared>,
}

impl FuncRunner {
    /// Create a runner holding only the control operations
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let operations = Arc::new(OperationRegistry::new());
            install_builtins(&operations, weak);
            Shared {
                operations,
                services: Arc::new(ServiceRegistry::new()),
                end_of_life: EndOfLifeQueue::new(),
                state: ArcSwap::from_pointee(ProcessState::empty()),
                load_lock: Mutex::new(()),
                loaders: Mutex::new(Vec::new()),
            }
        });
        Self { inner }
    }

    /// Load the bundle behind `loader` for the first time
    pub fn start(&self, properties: Params, loader: Arc<dyn ModuleLoader>) -> Result<LoadReport, RunnerError> {
        tracing::info!(version = CONTEXT_VERSION, "Starting Func Runner");
        self.load(properties, loader)
    }

    /// Load again while requests may be in flight
    ///
    /// Entries are replaced one name at a time; a request sees either the old
    /// or the new entry for each name. The property and loader snapshot is
    /// swapped in one step once loading has succeeded.
    pub fn reload(&self, properties: Params, loader: Arc<dyn ModuleLoader>) -> Result<LoadReport, RunnerError> {
        tracing::info!("Reloading bundle");
        self.load(properties, loader)
    }

    fn load(&self, properties: Params, loader: Arc<dyn ModuleLoader>) -> Result<LoadReport, RunnerError> {
        let _guard = self.inner.load_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // A load that fails part way may already have installed operations
        self.inner.retain(Arc::clone(&loader));

        let span = tracing::info_span!("load");
        let report = PluginLoader::new(&self.inner.operations, &self.inner.services, &self.inner.end_of_life)
            .load(&properties, loader, &span)?;
        self.inner.retain(Arc::clone(&report.loader));

        self.inner.state.store(Arc::new(ProcessState {
            properties,
            loader: Arc::clone(&report.loader),
            loaded_at: Some(Utc::now()),
        }));
        Ok(report)
    }

    /// Context protocol version
    pub fn version(&self) -> &'static str {
        CONTEXT_VERSION
    }

    /// Look up an operation by name
    pub fn operation(&self, name: &str) -> Option<Operation> {
        self.inner.operations.lookup(name)
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.inner.operations
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    /// Current process-wide snapshot
    pub fn state(&self) -> Arc<ProcessState> {
        self.inner.state.load_full()
    }

    pub fn effective_loader(&self) -> Arc<dyn ModuleLoader> {
        Arc::clone(&self.inner.state.load().loader)
    }

    /// Number of end-of-life callbacks still waiting to run
    pub fn pending_end_of_life(&self) -> usize {
        self.inner.end_of_life.len()
    }

    /// Number of loaders kept alive for what they installed
    pub fn retained_loaders(&self) -> usize {
        self.inner.loaders.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Create the context for one request
    pub fn new_context(&self, request: Params) -> RequestContext {
        RequestContext::new(
            RequestId::new(),
            request,
            self.inner.state.load_full(),
            Arc::clone(&self.inner.operations),
            Arc::clone(&self.inner.services),
        )
    }

    /// Run operation `name` against `request`
    ///
    /// Everything the operation vended is released before this returns, with
    /// `success` reflecting whether the operation returned `Ok`.
    pub fn dispatch(&self, name: &str, request: Params) -> Result<Value, RunnerError> {
        let ctx = self.new_context(request);
        let span = ctx.logger().clone();
        let _enter = span.enter();

        let Some(op) = ctx.operation(name) else {
            tracing::debug!(operation = %name, "No such operation");
            ctx.finished(false);
            return Err(RunnerError::UnknownOperation(name.to_string()));
        };

        tracing::debug!(operation = %name, "Dispatching");
        let dyn_ctx: &dyn Context = &ctx;
        let result = contain(|| op(dyn_ctx));
        let released = ctx.finished(result.is_ok());
        tracing::debug!(operation = %name, ok = result.is_ok(), released = released.released, "Request finished");

        result.map_err(|failure| match failure {
            PluginFailure::Error(source) => RunnerError::Operation {
                name: name.to_string(),
                source,
            },
            PluginFailure::Panic(message) => {
                tracing::warn!(operation = %name, %message, "Operation panicked");
                RunnerError::OperationPanicked {
                    name: name.to_string(),
                    message,
                }
            }
        })
    }

    /// Release every vendor, then run every end-of-life callback in
    /// registration order
    ///
    /// Both are drained as they run, so a second call finds nothing left to do.
    pub fn end_life(&self) -> EndOfLifeReport {
        self.end_life_under(&Span::current())
    }

    /// [`end_life`](Self::end_life), logging under `parent`
    pub fn end_life_under(&self, parent: &Span) -> EndOfLifeReport {
        let span = tracing::info_span!(parent: parent, "end_of_life");
        let _enter = span.enter();
        let mut report = EndOfLifeReport::default();

        for (name, vendor) in self.inner.services.drain() {
            report.vendors += 1;
            if let Err(failure) = contain(|| vendor.end_life()) {
                tracing::warn!(service = %name, error = %failure, "Exception ending service vendor");
                report.vendor_failures += 1;
            }
        }

        for (index, callback) in self.inner.end_of_life.drain().into_iter().enumerate() {
            report.callbacks += 1;
            if let Err(failure) = contain(|| callback(&span)) {
                tracing::warn!(index, error = %failure, "Exception running end-of-life callback");
                report.callback_failures += 1;
            }
        }

        tracing::info!(
            vendors = report.vendors,
            callbacks = report.callbacks,
            failures = report.vendor_failures + report.callback_failures,
            "End of life complete"
        );
        report
    }
}

impl Default for FuncRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FuncRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncRunner")
            .field("operations", &self.inner.operations)
            .field("services", &self.inner.services)
            .field("end_of_life", &self.inner.end_of_life.len())
            .finish()
    }
}

fn install_builtins(operations: &OperationRegistry, weak: &Weak<Shared>) {
    let shared = weak.clone();
    operations.install(
        builtin::OPERATIONS,
        operation(move |_ctx| {
            let shared = upgrade(&shared)?;
            let names: Vec<String> = shared.operations.names().into_iter().collect();
            Ok(json!(names))
        }),
    );

    let shared = weak.clone();
    operations.install(
        builtin::END_LIFE,
        operation(move |ctx| {
            let inner = upgrade(&shared)?;
            FuncRunner { inner }.end_life_under(ctx.logger());
            Ok(Value::Null)
        }),
    );

    let shared = weak.clone();
    operations.install(
        builtin::GET_CLASSLOADER,
        operation(move |_ctx| {
            let shared = upgrade(&shared)?;
            let state = shared.state.load();
            Ok(json!({
                "loader": state.loader.describe(),
                "loaded_at": state.loaded_at.map(|at| at.to_rfc3339()),
            }))
        }),
    );
}

fn upgrade(weak: &Weak<Shared>) -> Result<Arc<Shared>, FuncError> {
    weak.upgrade()
        .ok_or_else(|| FuncError::Internal("runner has shut down".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use func_runner_sdk::operation::end_of_life;
    use func_runner_sdk::{AnyVendor, OperationHost, OperationInstaller, ServiceVendor};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl Journal {
        fn write(&self, entry: impl Into<String>) {
            self.entries.lock().unwrap().push(entry.into());
        }

        fn read(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }

    struct Tokens {
        journal: Arc<Journal>,
        next: AtomicUsize,
    }

    impl ServiceVendor for Tokens {
        type Item = usize;

        fn vend(&self, _ctx: &dyn Context) -> Result<usize, FuncError> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn release(&self, item: usize, success: bool) -> Result<(), FuncError> {
            self.journal.write(format!("release {item} {success}"));
            Ok(())
        }

        fn end_life(&self) -> Result<(), FuncError> {
            self.journal.write("vendor end");
            Ok(())
        }
    }

    struct Handlers {
        journal: Arc<Journal>,
    }

    impl OperationInstaller for Handlers {
        fn install_operations(&self, host: &dyn OperationHost) -> Result<(), FuncError> {
            host.add_operation(
                "take",
                operation(|ctx| {
                    let token: usize = ctx.vend_for_name("tokens")?;
                    Ok(json!(token))
                }),
            );
            host.add_operation(
                "take-and-fail",
                operation(|ctx| {
                    let _token: usize = ctx.vend_for_name("tokens")?;
                    Err(FuncError::operation("nope"))
                }),
            );
            host.add_operation(
                "take-and-panic",
                operation(|ctx| {
                    let _token: usize = ctx.vend_for_name("tokens")?;
                    panic!("operation blew up")
                }),
            );
            let journal = Arc::clone(&self.journal);
            host.add_end_of_life(end_of_life(move |_span| {
                journal.write("callback");
                Ok(())
            }));
            Ok(())
        }
    }

    fn started(journal: &Arc<Journal>) -> FuncRunner {
        let runner = FuncRunner::new();
        let bundle = Bundle::new("tokens").with_installer(Handlers { journal: Arc::clone(journal) });
        runner.start(Params::new(), Arc::new(bundle)).unwrap();
        runner.services().register(
            "tokens",
            AnyVendor::new(Tokens {
                journal: Arc::clone(journal),
                next: AtomicUsize::new(0),
            }),
        );
        runner
    }

    #[test]
    fn test_builtins_present() {
        let runner = FuncRunner::new();

        let names = runner.dispatch(builtin::OPERATIONS, Params::new()).unwrap();
        assert_eq!(names, json!(["endLife", "getClassloader", "operations"]));
        assert_eq!(runner.version(), "1");
    }

    #[test]
    fn test_get_classloader_reports_effective_loader() {
        let runner = FuncRunner::new();
        let before = runner.dispatch(builtin::GET_CLASSLOADER, Params::new()).unwrap();
        assert_eq!(before["loader"]["name"], "empty");
        assert!(before["loaded_at"].is_null());

        runner.start(Params::new(), Arc::new(Bundle::new("pets"))).unwrap();

        let after = runner.dispatch(builtin::GET_CLASSLOADER, Params::new()).unwrap();
        assert_eq!(after["loader"]["name"], "pets");
        assert!(after["loaded_at"].is_string());
    }

    #[test]
    fn test_dispatch_releases_with_outcome() {
        let journal = Arc::new(Journal::default());
        let runner = started(&journal);

        assert_eq!(runner.dispatch("take", Params::new()).unwrap(), json!(0));
        let err = runner.dispatch("take-and-fail", Params::new()).unwrap_err();
        assert!(matches!(err, RunnerError::Operation { .. }));

        assert_eq!(journal.read(), vec!["release 0 true", "release 1 false"]);
    }

    #[test]
    fn test_dispatch_contains_panics() {
        let journal = Arc::new(Journal::default());
        let runner = started(&journal);

        let err = runner.dispatch("take-and-panic", Params::new()).unwrap_err();

        assert!(matches!(err, RunnerError::OperationPanicked { .. }));
        assert_eq!(journal.read(), vec!["release 0 false"]);
    }

    #[test]
    fn test_dispatch_unknown_operation() {
        let runner = FuncRunner::new();

        let err = runner.dispatch("missing", Params::new()).unwrap_err();
        assert!(matches!(err, RunnerError::UnknownOperation(name) if name == "missing"));
    }

    #[test]
    fn test_end_life_runs_once() {
        let journal = Arc::new(Journal::default());
        let runner = started(&journal);

        runner.dispatch(builtin::END_LIFE, Params::new()).unwrap();
        let again = runner.end_life();

        assert_eq!(journal.read(), vec!["vendor end", "callback"]);
        assert_eq!(again, EndOfLifeReport::default());
        assert!(runner.services().is_empty());
        assert_eq!(runner.pending_end_of_life(), 0);
        assert!(runner.operation("take").is_some());
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let runner = FuncRunner::new();
        runner
            .start(params(json!({"greeting": "hello"})), Arc::new(Bundle::new("v1")))
            .unwrap();
        let in_flight = runner.new_context(Params::new());

        runner
            .reload(params(json!({"greeting": "hi"})), Arc::new(Bundle::new("v2")))
            .unwrap();

        assert_eq!(in_flight.properties().get("greeting"), Some(&json!("hello")));
        let fresh = runner.new_context(Params::new());
        assert_eq!(fresh.properties().get("greeting"), Some(&json!("hi")));
        assert_eq!(runner.effective_loader().describe()["name"], "v2");
    }

    /// A bundle that notices when it is dropped, the way a library notices
    /// being unmapped
    struct Unloads {
        bundle: Bundle,
        mapped: Arc<AtomicBool>,
    }

    impl Drop for Unloads {
        fn drop(&mut self) {
            self.mapped.store(false, Ordering::SeqCst);
        }
    }

    impl ModuleLoader for Unloads {
        fn describe(&self) -> Value {
            self.bundle.describe()
        }

        fn loader_extensions(&self) -> Result<Vec<Arc<dyn func_runner_sdk::LoaderExtension>>, DiscoveryError> {
            self.bundle.loader_extensions()
        }

        fn operation_installers(&self) -> Result<Vec<Arc<dyn OperationInstaller>>, DiscoveryError> {
            self.bundle.operation_installers()
        }

        fn vendor_builders(&self) -> Result<Vec<Arc<dyn func_runner_sdk::ServiceVendorBuilder>>, DiscoveryError> {
            self.bundle.vendor_builders()
        }
    }

    struct ChecksMapped(Arc<AtomicBool>);

    impl OperationInstaller for ChecksMapped {
        fn install_operations(&self, host: &dyn OperationHost) -> Result<(), FuncError> {
            let mapped = Arc::clone(&self.0);
            host.add_operation(
                "mapped",
                operation(move |_ctx| {
                    if !mapped.load(Ordering::SeqCst) {
                        return Err(FuncError::Internal("code of a dropped loader".to_string()));
                    }
                    Ok(json!(true))
                }),
            );
            Ok(())
        }
    }

    #[test]
    fn test_reload_keeps_earlier_loaders_alive() {
        let mapped = Arc::new(AtomicBool::new(true));
        let runner = FuncRunner::new();
        let first = Unloads {
            bundle: Bundle::new("v1").with_installer(ChecksMapped(Arc::clone(&mapped))),
            mapped: Arc::clone(&mapped),
        };
        runner.start(Params::new(), Arc::new(first)).unwrap();

        runner.reload(Params::new(), Arc::new(Bundle::new("v2"))).unwrap();

        assert_eq!(runner.effective_loader().describe()["name"], "v2");
        assert_eq!(runner.dispatch("mapped", Params::new()).unwrap(), json!(true));
        assert_eq!(runner.retained_loaders(), 2);

        drop(runner);
        assert!(!mapped.load(Ordering::SeqCst));
    }

    #[traced_test]
    #[test]
    fn test_end_life_operation_logs_under_caller() {
        let journal = Arc::new(Journal::default());
        let runner = started(&journal);
        let ctx = runner.new_context(Params::new());
        let op = runner.operation(builtin::END_LIFE).unwrap();

        let dyn_ctx: &dyn Context = &ctx;
        op(dyn_ctx).unwrap();

        assert!(logs_contain("End of life complete"));
        assert!(logs_contain(&ctx.request_id().to_string()));
    }

    #[test]
    fn test_failed_load_keeps_snapshot() {
        struct Broken;

        impl ModuleLoader for Broken {
            fn describe(&self) -> Value {
                json!({"kind": "broken"})
            }

            fn loader_extensions(
                &self,
            ) -> Result<Vec<Arc<dyn func_runner_sdk::LoaderExtension>>, DiscoveryError> {
                Err(DiscoveryError::Provider("unreadable".to_string()))
            }

            fn operation_installers(&self) -> Result<Vec<Arc<dyn OperationInstaller>>, DiscoveryError> {
                Ok(Vec::new())
            }

            fn vendor_builders(
                &self,
            ) -> Result<Vec<Arc<dyn func_runner_sdk::ServiceVendorBuilder>>, DiscoveryError> {
                Ok(Vec::new())
            }
        }

        let runner = FuncRunner::new();
        runner.start(Params::new(), Arc::new(Bundle::new("good"))).unwrap();

        let err = runner.reload(Params::new(), Arc::new(Broken)).unwrap_err();

        assert!(matches!(err, RunnerError::Discovery(_)));
        assert_eq!(runner.effective_loader().describe()["name"], "good");
    }
}
