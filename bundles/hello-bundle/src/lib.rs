//! Hello bundle
//!
//! A minimal Func Bundle built as a dynamic library. Point the runner at it
//! with `FUNC_RUNNER_BUNDLE=target/release/libhello_bundle.so` and declare a
//! counter service in the bootstrap properties:
//!
//! ```json
//! {"visits": {"type": "counter", "start": 100}}
//! ```
//!
//! The library carries its own copy of `tracing`. The runner attaches it to
//! its own subscriber when it opens the library; before that, events logged
//! here are dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use func_runner_sdk::prelude::*;

/// Installs `hello`, `whoami` and `visit`
pub struct Greeter;

impl OperationInstaller for Greeter {
    fn name(&self) -> &str {
        "hello-bundle"
    }

    fn install_operations(&self, host: &dyn OperationHost) -> Result<(), FuncError> {
        host.add_operation(
            "hello",
            operation(|ctx| {
                let params = ctx.merged_params();
                let name = params.get("name").and_then(Value::as_str).unwrap_or("World");
                Ok(json!({ "message": format!("Hello, {name}!") }))
            }),
        );

        host.add_operation(
            "whoami",
            operation(|ctx| {
                Ok(json!({
                    "uri": ctx.uri(),
                    "method": ctx.method(),
                    "host": ctx.host(),
                    "services": ctx.services(),
                }))
            }),
        );

        host.add_operation(
            "visit",
            operation(|ctx| {
                let visit: u64 = ctx.vend_for_name("visits")?;
                ctx.logger().in_scope(|| tracing::info!(visit, "Counted a visit"));
                Ok(json!({ "visit": visit }))
            }),
        );

        host.add_end_of_life(end_of_life(|span| {
            span.in_scope(|| tracing::info!("Hello bundle says goodbye"));
            Ok(())
        }));

        host.logger()
            .in_scope(|| tracing::info!(loader = %host.loader().describe(), "Hello bundle installed"));
        Ok(())
    }
}

/// Counts visits; every vended item is the next number
pub struct Counter {
    next: AtomicU64,
    returned: AtomicU64,
}

impl ServiceVendor for Counter {
    type Item = u64;

    fn vend(&self, _ctx: &dyn Context) -> Result<u64, FuncError> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn release(&self, _item: u64, success: bool) -> Result<(), FuncError> {
        if success {
            self.returned.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn end_life(&self) -> Result<(), FuncError> {
        tracing::info!(
            vended = self.next.load(Ordering::SeqCst),
            completed = self.returned.load(Ordering::SeqCst),
            "Counter closed"
        );
        Ok(())
    }
}

/// Builds [`Counter`]s for `"type": "counter"` services
pub struct CounterBuilder;

impl ServiceVendorBuilder for CounterBuilder {
    fn for_type(&self) -> &str {
        "counter"
    }

    fn build_vendor(&self, name: &str, config: &Params, logger: &Span) -> Result<Option<AnyVendor>, FuncError> {
        let start = match config.get("start") {
            None => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| FuncError::InvalidConfig(format!("{name}: start must be a whole number")))?,
        };
        logger.in_scope(|| tracing::info!(service = %name, start, "Built counter"));

        Ok(Some(AnyVendor::new(Counter {
            next: AtomicU64::new(start),
            returned: AtomicU64::new(0),
        })))
    }
}

/// Every provider this library contributes
pub fn bundle() -> Bundle {
    Bundle::new("hello-bundle")
        .with_installer(Greeter)
        .with_builder(CounterBuilder)
}

export_bundle!(bundle());
