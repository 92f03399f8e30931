//! Publish logging.

use std::time::Instant;

use tracing::{debug, error};

use super::{Middleware, Next};
use crate::bus::context::SignalBusContext;
use crate::error::Result;

/// Logs each publish with its method, message type, subscriber count and
/// timing. Failures are logged and then returned unchanged.
#[derive(Debug, Default, Clone)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for LoggingMiddleware {
    fn handle(&self, ctx: &mut SignalBusContext, next: &Next) -> Result<()> {
        let started = Instant::now();
        debug!(
            method = %ctx.method(),
            message_type = ctx.message_type(),
            subscribers = ctx.subscriber_count(),
            correlation_id = ctx.correlation_id(),
            "Publishing message"
        );

        let result = next(ctx);
        let elapsed_us = started.elapsed().as_micros() as u64;

        match &result {
            Ok(()) => debug!(
                method = %ctx.method(),
                message_type = ctx.message_type(),
                cancelled = ctx.is_cancelled(),
                elapsed_us,
                "Publish pipeline finished"
            ),
            Err(err) => error!(
                method = %ctx.method(),
                message_type = ctx.message_type(),
                elapsed_us,
                error = %err,
                "Publish pipeline failed"
            ),
        }

        result
    }

    fn name(&self) -> &str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::middleware::test_support::context;
    use crate::bus::middleware::MiddlewareBuilder;
    use crate::error::BusError;

    #[test]
    fn logging_passes_through() {
        let pipeline = MiddlewareBuilder::new()
            .use_default::<LoggingMiddleware>()
            .build();

        let mut ctx = context(1);
        pipeline.run(&mut ctx).unwrap();
        assert!(ctx.was_dispatched());
    }

    #[test]
    fn logging_rethrows_failures() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let pipeline = MiddlewareBuilder::new()
            .use_default::<LoggingMiddleware>()
            .use_fn(|_, _| Err(BusError::middleware("downstream")))
            .build();

        let mut ctx = context(1);
        let err = pipeline.run(&mut ctx).unwrap_err();
        assert!(matches!(err, BusError::Middleware(_)));
    }
}
