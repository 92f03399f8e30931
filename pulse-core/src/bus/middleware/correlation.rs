//! Correlation ID assignment.

use std::sync::Arc;

use uuid::Uuid;

use super::{Middleware, Next};
use crate::bus::context::SignalBusContext;
use crate::error::Result;

/// Fills in a correlation ID when the publish has none, then always
/// continues the chain.
#[derive(Clone)]
pub struct CorrelationIdMiddleware {
    generate: Arc<dyn Fn() -> String + Send + Sync>,
}

impl CorrelationIdMiddleware {
    /// Generate random UUIDv4 IDs.
    pub fn new() -> Self {
        Self::with_generator(|| Uuid::new_v4().to_string())
    }

    /// Generate IDs with a custom function.
    pub fn with_generator<F>(generate: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            generate: Arc::new(generate),
        }
    }
}

impl Default for CorrelationIdMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for CorrelationIdMiddleware {
    fn handle(&self, ctx: &mut SignalBusContext, next: &Next) -> Result<()> {
        if ctx.correlation_id().is_none() {
            ctx.set_correlation_id((self.generate)());
        }
        next(ctx)
    }

    fn name(&self) -> &str {
        "correlation-id"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::middleware::test_support::context;
    use crate::bus::middleware::MiddlewareBuilder;

    #[test]
    fn assigns_missing_id() {
        let pipeline = MiddlewareBuilder::new()
            .use_default::<CorrelationIdMiddleware>()
            .build();

        let mut ctx = context(1);
        pipeline.run(&mut ctx).unwrap();

        let id = ctx.correlation_id().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert!(ctx.was_dispatched());
    }

    #[test]
    fn keeps_existing_id() {
        let pipeline = MiddlewareBuilder::new()
            .use_middleware(CorrelationIdMiddleware::with_generator(|| "fresh".into()))
            .build();

        let mut ctx = context(1);
        ctx.set_correlation_id("given");
        pipeline.run(&mut ctx).unwrap();

        assert_eq!(ctx.correlation_id(), Some("given"));
    }
}
