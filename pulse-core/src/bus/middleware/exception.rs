//! Failure capture for the rest of the pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use super::{Middleware, Next};
use crate::bus::context::SignalBusContext;
use crate::error::{BusError, Result};

type ErrorCallback = Arc<dyn Fn(&BusError, &SignalBusContext) + Send + Sync>;

/// Catches errors and panics from the middleware after it.
///
/// Each failure is reported to the callback. When swallowing (the default)
/// the publish is cancelled and reported as successful; otherwise the error
/// is returned to the publisher.
#[derive(Clone)]
pub struct ExceptionHandlingMiddleware {
    on_error: ErrorCallback,
    swallow: bool,
}

impl ExceptionHandlingMiddleware {
    /// Log failures and swallow them.
    pub fn new() -> Self {
        Self::with_callback(|err, ctx| {
            error!(
                message_type = ctx.message_type(),
                correlation_id = ctx.correlation_id(),
                error = %err,
                "Publish failed in middleware"
            );
        })
    }

    /// Report failures to `on_error` and swallow them.
    pub fn with_callback<F>(on_error: F) -> Self
    where
        F: Fn(&BusError, &SignalBusContext) + Send + Sync + 'static,
    {
        Self {
            on_error: Arc::new(on_error),
            swallow: true,
        }
    }

    /// Choose whether reported failures are swallowed or returned.
    pub fn swallow(mut self, swallow: bool) -> Self {
        self.swallow = swallow;
        self
    }
}

impl Default for ExceptionHandlingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for ExceptionHandlingMiddleware {
    fn handle(&self, ctx: &mut SignalBusContext, next: &Next) -> Result<()> {
        let outcome = catch_unwind(AssertUnwindSafe(|| next(ctx)));
        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err,
            Err(panic) => BusError::Panicked(panic_message(panic.as_ref())),
        };

        (self.on_error)(&err, ctx);

        if self.swallow {
            ctx.cancel();
            Ok(())
        } else {
            Err(err)
        }
    }

    fn name(&self) -> &str {
        "exception-handling"
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::middleware::test_support::context;
    use crate::bus::middleware::MiddlewareBuilder;
    use parking_lot::Mutex;

    #[test]
    fn swallows_and_cancels() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let pipeline = MiddlewareBuilder::new()
            .use_middleware(ExceptionHandlingMiddleware::with_callback(move |err, _| {
                seen_clone.lock().push(err.to_string());
            }))
            .use_fn(|_, _| Err(BusError::middleware("bad")))
            .build();

        let mut ctx = context(1);
        pipeline.run(&mut ctx).unwrap();

        assert!(ctx.is_cancelled());
        assert_eq!(*seen.lock(), vec!["Middleware error: bad".to_string()]);
    }

    #[test]
    fn rethrows_when_not_swallowing() {
        let pipeline = MiddlewareBuilder::new()
            .use_middleware(ExceptionHandlingMiddleware::with_callback(|_, _| {}).swallow(false))
            .use_fn(|_, _| Err(BusError::middleware("bad")))
            .build();

        let mut ctx = context(1);
        assert!(pipeline.run(&mut ctx).is_err());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn catches_panics() {
        let pipeline = MiddlewareBuilder::new()
            .use_default::<ExceptionHandlingMiddleware>()
            .use_fn(|_, _| panic!("kaboom"))
            .build();

        let mut ctx = context(1);
        pipeline.run(&mut ctx).unwrap();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn passes_through_on_success() {
        let pipeline = MiddlewareBuilder::new()
            .use_default::<ExceptionHandlingMiddleware>()
            .build();

        let mut ctx = context(1);
        pipeline.run(&mut ctx).unwrap();
        assert!(ctx.was_dispatched());
    }
}
