//! The request context seen by operations and service vendors
//!
//! The runner builds one context per request around the raw request mapping
//! handed over by the transport layer. Every derived view defaults to an empty
//! mapping when the underlying structure is missing, so handlers never have to
//! guard against absent keys.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::Span;

use crate::error::FuncError;
use crate::operation::Operation;
use crate::vendor::{AnyVendor, Releasable, ReleasePair, ServiceVendor};

/// A string-keyed mapping of arbitrary values (requests, parameters, properties)
pub type Params = Map<String, Value>;

/// Top-level keys of the raw request mapping
pub mod keys {
    pub const URI: &str = "uri";
    pub const SCHEME: &str = "scheme";
    pub const HOST: &str = "host";
    pub const METHOD: &str = "request-method";
    pub const HEADERS: &str = "headers";
    pub const PARAMETERS: &str = "parameters";

    /// Sub-keys of the `parameters` mapping
    pub const PATH: &str = "path";
    pub const QUERY: &str = "query";
    pub const BODY: &str = "body";
}

/// Per-request context handed to every operation
///
/// Implementors supply the raw data and the process-wide hooks; the request
/// views are derived from [`Context::request_info`].
pub trait Context: Send + Sync {
    /// The raw request mapping
    fn request_info(&self) -> &Params;

    /// Logging sink for this request
    fn logger(&self) -> &Span;

    /// Process-wide properties captured at the last successful load
    fn properties(&self) -> &Params;

    /// Names of all registered service vendors
    fn services(&self) -> BTreeSet<String>;

    /// Look up a service vendor by name
    fn service_for_name(&self, name: &str) -> Option<AnyVendor>;

    /// Look up an installed operation by name
    fn operation(&self, name: &str) -> Option<Operation>;

    /// Record a vended item for release when the request finishes
    fn accumulate_releasable(&self, pair: Box<dyn Releasable>);

    fn uri(&self) -> Option<&str> {
        string_at(self.request_info(), keys::URI)
    }

    fn scheme(&self) -> Option<&str> {
        string_at(self.request_info(), keys::SCHEME)
    }

    fn host(&self) -> Option<&str> {
        string_at(self.request_info(), keys::HOST)
    }

    /// Request method (e.g. GET, POST)
    fn method(&self) -> Option<&str> {
        string_at(self.request_info(), keys::METHOD)
    }

    fn headers(&self) -> Params {
        map_at(self.request_info(), keys::HEADERS)
    }

    /// The whole `parameters` mapping (path, query and body sub-maps)
    fn request_params(&self) -> Params {
        map_at(self.request_info(), keys::PARAMETERS)
    }

    fn path_params(&self) -> Params {
        map_at(&self.request_params(), keys::PATH)
    }

    fn query_params(&self) -> Params {
        map_at(&self.request_params(), keys::QUERY)
    }

    fn body_params(&self) -> Params {
        map_at(&self.request_params(), keys::BODY)
    }

    /// Path and query parameters together; query wins on collision
    fn merged_params(&self) -> Params {
        let mut merged = self.path_params();
        merged.extend(self.query_params());
        merged
    }
}

impl dyn Context + '_ {
    /// Record `item` so that `vendor.release(item, success)` runs when the
    /// request finishes
    pub fn accumulate<T>(&self, item: T, vendor: Arc<dyn ServiceVendor<Item = T>>)
    where
        T: Clone + Send + Sync + 'static,
    {
        tracing::trace!(item = std::any::type_name::<T>(), "Accumulating");
        self.accumulate_releasable(Box::new(ReleasePair::new(item, vendor)));
    }

    /// Vend an item of type `T` from the named service.
    ///
    /// The item is recorded for release before it is returned. Fails when no
    /// such service exists or when the service produces a different type.
    ///
    /// ```ignore
    /// let conn: PooledConnection = ctx.vend_for_name("db")?;
    /// ```
    pub fn vend_for_name<T>(&self, name: &str) -> Result<T, FuncError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let vendor = self
            .service_for_name(name)
            .ok_or_else(|| FuncError::ServiceNotFound(name.to_string()))?;
        let typed = vendor.downcast::<T>(name)?;
        let item = typed.vend(self)?;
        self.accumulate(item.clone(), typed);
        Ok(item)
    }
}

fn string_at<'a>(map: &'a Params, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn map_at(map: &Params, key: &str) -> Params {
    match map.get(key) {
        Some(Value::Object(inner)) => inner.clone(),
        _ => Params::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct BareContext {
        data: Params,
        span: Span,
        props: Params,
        released: Mutex<Vec<Box<dyn Releasable>>>,
    }

    impl BareContext {
        fn new(data: Value) -> Self {
            let data = match data {
                Value::Object(map) => map,
                _ => Params::new(),
            };
            Self {
                data,
                span: Span::none(),
                props: Params::new(),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    impl Context for BareContext {
        fn request_info(&self) -> &Params {
            &self.data
        }

        fn logger(&self) -> &Span {
            &self.span
        }

        fn properties(&self) -> &Params {
            &self.props
        }

        fn services(&self) -> BTreeSet<String> {
            BTreeSet::new()
        }

        fn service_for_name(&self, _name: &str) -> Option<AnyVendor> {
            None
        }

        fn operation(&self, _name: &str) -> Option<Operation> {
            None
        }

        fn accumulate_releasable(&self, pair: Box<dyn Releasable>) {
            self.released.lock().unwrap().push(pair);
        }
    }

    #[test]
    fn test_scalar_views() {
        let ctx = BareContext::new(json!({
            "uri": "/pets/1",
            "scheme": "https",
            "host": "api.example.com",
            "request-method": "GET",
        }));

        assert_eq!(ctx.uri(), Some("/pets/1"));
        assert_eq!(ctx.scheme(), Some("https"));
        assert_eq!(ctx.host(), Some("api.example.com"));
        assert_eq!(ctx.method(), Some("GET"));
    }

    #[test]
    fn test_missing_maps_are_empty() {
        let ctx = BareContext::new(json!({}));

        assert!(ctx.headers().is_empty());
        assert!(ctx.request_params().is_empty());
        assert!(ctx.path_params().is_empty());
        assert!(ctx.query_params().is_empty());
        assert!(ctx.body_params().is_empty());
        assert!(ctx.merged_params().is_empty());
        assert_eq!(ctx.uri(), None);
    }

    #[test]
    fn test_non_map_values_are_empty() {
        let ctx = BareContext::new(json!({
            "headers": "not a map",
            "parameters": {"path": 42, "body": ["a"]},
        }));

        assert!(ctx.headers().is_empty());
        assert!(ctx.path_params().is_empty());
        assert!(ctx.body_params().is_empty());
    }

    #[test]
    fn test_merged_params_query_wins() {
        let ctx = BareContext::new(json!({
            "parameters": {
                "path": {"id": "1"},
                "query": {"id": "2", "sort": "asc"},
                "body": {"name": "rex"},
            }
        }));

        let merged = ctx.merged_params();
        assert_eq!(Value::Object(merged), json!({"id": "2", "sort": "asc"}));
        assert_eq!(ctx.body_params().get("name"), Some(&json!("rex")));
    }

    #[test]
    fn test_vend_for_missing_service() {
        let ctx = BareContext::new(json!({}));
        let ctx: &dyn Context = &ctx;

        let err = ctx.vend_for_name::<String>("db").unwrap_err();
        assert!(matches!(err, FuncError::ServiceNotFound(name) if name == "db"));
    }
}
