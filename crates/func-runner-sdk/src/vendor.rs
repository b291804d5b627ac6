//! Service vendors: named factories/pools for request resources
//!
//! A vendor hands out items (connections, clients, handles) during a request
//! and takes them back once the request finishes. The runner stores vendors of
//! different item types side by side behind [`AnyVendor`]; callers name the
//! type they expect and get a [`FuncError::TypeMismatch`] if it is wrong.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use tracing::Span;

use crate::context::{Context, Params};
use crate::error::FuncError;

/// A factory or pool for resources of one type
///
/// Vendors are shared by every request and must be safe to call concurrently.
pub trait ServiceVendor: Send + Sync {
    /// The type of item this vendor produces
    type Item: Clone + Send + Sync + 'static;

    /// Produce an item for the request behind `ctx`
    fn vend(&self, ctx: &dyn Context) -> Result<Self::Item, FuncError>;

    /// Take back an item once the request is done. `success` reports the
    /// outcome of the request (commit vs. rollback, for instance).
    fn release(&self, item: Self::Item, success: bool) -> Result<(), FuncError>;

    /// Release everything the vendor holds; called once at process end-of-life
    fn end_life(&self) -> Result<(), FuncError> {
        Ok(())
    }
}

/// Builds vendors for one declared service `type`
pub trait ServiceVendorBuilder: Send + Sync {
    /// The `type` value of the configuration blocks this builder handles
    fn for_type(&self) -> &str;

    /// Build a vendor for service `name` from its configuration block.
    /// `Ok(None)` means the builder declined without error.
    fn build_vendor(
        &self,
        name: &str,
        config: &Params,
        logger: &Span,
    ) -> Result<Option<AnyVendor>, FuncError>;

    /// Providers are applied in ascending order
    fn order(&self) -> i32 {
        0
    }
}

trait ErasedVendor: Send + Sync {
    fn item_type(&self) -> &'static str;
    fn end_life(&self) -> Result<(), FuncError>;
    fn as_any(&self) -> &dyn Any;
}

struct Typed<T: 'static>(Arc<dyn ServiceVendor<Item = T>>);

impl<T> ErasedVendor for Typed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn item_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn end_life(&self) -> Result<(), FuncError> {
        self.0.end_life()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type-erased, cheaply cloneable handle to a [`ServiceVendor`]
#[derive(Clone)]
pub struct AnyVendor {
    inner: Arc<dyn ErasedVendor>,
    type_id: TypeId,
}

impl AnyVendor {
    /// Wrap a vendor
    pub fn new<V>(vendor: V) -> Self
    where
        V: ServiceVendor + 'static,
    {
        let vendor: Arc<dyn ServiceVendor<Item = V::Item>> = Arc::new(vendor);
        Self::from_arc(vendor)
    }

    /// Wrap an already shared vendor
    pub fn from_arc<T>(vendor: Arc<dyn ServiceVendor<Item = T>>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Typed(vendor)),
            type_id: TypeId::of::<T>(),
        }
    }

    /// Name of the produced item type
    pub fn item_type(&self) -> &'static str {
        self.inner.item_type()
    }

    /// Whether this vendor produces items of type `T`
    pub fn produces<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Recover the typed vendor. `service` is only used for the error message.
    pub fn downcast<T>(&self, service: &str) -> Result<Arc<dyn ServiceVendor<Item = T>>, FuncError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner
            .as_any()
            .downcast_ref::<Typed<T>>()
            .map(|typed| Arc::clone(&typed.0))
            .ok_or_else(|| FuncError::TypeMismatch {
                service: service.to_string(),
                expected: type_name::<T>(),
                actual: self.item_type(),
            })
    }

    /// Forward end-of-life to the wrapped vendor
    pub fn end_life(&self) -> Result<(), FuncError> {
        self.inner.end_life()
    }
}

impl fmt::Debug for AnyVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyVendor")
            .field("item_type", &self.item_type())
            .finish()
    }
}

/// Something the accumulator can release at the end of a request
pub trait Releasable: Send {
    fn release(self: Box<Self>, success: bool) -> Result<(), FuncError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// A vended item together with the vendor that produced it
pub struct ReleasePair<T: 'static> {
    item: T,
    vendor: Arc<dyn ServiceVendor<Item = T>>,
}

impl<T> ReleasePair<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(item: T, vendor: Arc<dyn ServiceVendor<Item = T>>) -> Self {
        Self { item, vendor }
    }
}

impl<T> Releasable for ReleasePair<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn release(self: Box<Self>, success: bool) -> Result<(), FuncError> {
        let ReleasePair { item, vendor } = *self;
        vendor.release(item, success)
    }

    fn describe(&self) -> String {
        type_name::<T>().to_string()
    }
}
