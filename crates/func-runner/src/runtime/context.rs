//! Request context
//!
//! The runner's implementation of the SDK [`Context`]: one per request,
//! wrapping the raw request mapping, a request-scoped tracing span, the
//! process-wide snapshot captured when the request started, and the
//! request's [`Accumulator`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Span;
use uuid::Uuid;

use func_runner_sdk::{AnyVendor, Context, FuncError, Operation, Params, Releasable, ServiceVendor};

use super::accumulator::{Accumulator, ReleaseReport};
use super::lifecycle::ProcessState;
use super::operations::OperationRegistry;
use super::services::ServiceRegistry;

/// Request identifier for tracing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new random request ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from a string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context for one request
///
/// Read-only apart from its accumulator. Create it through
/// [`FuncRunner::new_context`](super::FuncRunner::new_context), hand it to the
/// operation, then call [`RequestContext::finished`] exactly once.
pub struct RequestContext {
    request_id: RequestId,
    data: Params,
    span: Span,
    state: Arc<ProcessState>,
    operations: Arc<OperationRegistry>,
    services: Arc<ServiceRegistry>,
    accumulator: Accumulator,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: RequestId,
        data: Params,
        state: Arc<ProcessState>,
        operations: Arc<OperationRegistry>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        let span = tracing::debug_span!("request", request_id = %request_id);
        Self {
            request_id,
            data,
            span,
            state,
            operations,
            services,
            accumulator: Accumulator::new(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The process-wide snapshot this request runs against
    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Vend an item from the named service; see [`Context::vend_for_name`]
    pub fn vend_for_name<T>(&self, name: &str) -> Result<T, FuncError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let ctx: &dyn Context = self;
        ctx.vend_for_name(name)
    }

    /// Record an item for release when the request finishes
    pub fn accumulate<T>(&self, item: T, vendor: Arc<dyn ServiceVendor<Item = T>>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let ctx: &dyn Context = self;
        ctx.accumulate(item, vendor);
    }

    /// Release everything vended during the request, passing the outcome on
    pub fn finished(&self, success: bool) -> ReleaseReport {
        self.accumulator.finished(success, &self.span)
    }
}

impl Context for RequestContext {
    fn request_info(&self) -> &Params {
        &self.data
    }

    fn logger(&self) -> &Span {
        &self.span
    }

    fn properties(&self) -> &Params {
        &self.state.properties
    }

    fn services(&self) -> BTreeSet<String> {
        self.services.names()
    }

    fn service_for_name(&self, name: &str) -> Option<AnyVendor> {
        self.services.lookup(name)
    }

    fn operation(&self, name: &str) -> Option<Operation> {
        self.operations.lookup(name)
    }

    fn accumulate_releasable(&self, pair: Box<dyn Releasable>) {
        self.span.in_scope(|| self.accumulator.accumulate(pair));
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        let pending = self.accumulator.pending_count();
        if pending > 0 && !self.accumulator.is_finished() {
            self.span.in_scope(|| {
                tracing::warn!(pending, "Request context dropped without finishing; resources were not released");
            });
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("uri", &self.uri())
            .field("accumulator", &self.accumulator)
            .finish()
    }
}
