//! Middleware Pipeline
//!
//! Cross-cutting handlers that wrap every publish, in the style of HTTP
//! middleware stacks.
//!
//! # How the Pipeline Is Built
//!
//! 1. Each registration adds a component: a function from the next handler
//!    to a new handler.
//!
//! 2. Each run folds the components right to left over a terminal handler,
//!    so the first registered middleware is the outermost.
//!
//! 3. The bus supplies a terminal that delivers to subscribers, unless the
//!    context is cancelled by the time the chain reaches it. Code after
//!    `next(ctx)` therefore runs once delivery has finished.
//!
//! A pipeline is immutable once built; a bus keeps the pipeline it was
//! created with.

mod correlation;
mod exception;
mod logging;
mod validation;

use std::sync::Arc;

use super::context::SignalBusContext;
use crate::error::Result;

pub use correlation::CorrelationIdMiddleware;
pub use exception::ExceptionHandlingMiddleware;
pub use logging::LoggingMiddleware;
pub use validation::{ValidationMiddleware, VALIDATION_FAILED_KEY};

pub(crate) use exception::panic_message;

/// A composed publish handler: the rest of the pipeline from some point on.
pub type Next = Arc<dyn Fn(&mut SignalBusContext) -> Result<()> + Send + Sync>;

type Component = Box<dyn Fn(Next) -> Next + Send + Sync>;

/// A cross-cutting publish handler.
///
/// Call `next(ctx)` to continue the chain. Returning without calling it
/// short-circuits the remaining middleware and subscriber delivery.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: &mut SignalBusContext, next: &Next) -> Result<()>;

    /// Name used in diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Collects middleware in registration order.
///
/// # Example
///
/// ```rust
/// use pulse_core::bus::{CorrelationIdMiddleware, LoggingMiddleware, MiddlewareBuilder};
///
/// let pipeline = MiddlewareBuilder::new()
///     .use_default::<LoggingMiddleware>()
///     .use_default::<CorrelationIdMiddleware>()
///     .use_fn(|ctx, next| {
///         ctx.insert_item("seen", true);
///         next(ctx)
///     })
///     .build();
///
/// assert_eq!(pipeline.len(), 3);
/// ```
#[derive(Default)]
pub struct MiddlewareBuilder {
    components: Vec<Component>,
    names: Vec<String>,
}

impl MiddlewareBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure middleware.
    pub fn use_fn<F>(self, handler: F) -> Self
    where
        F: Fn(&mut SignalBusContext, &Next) -> Result<()> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.push("closure".to_string(), move |next: Next| -> Next {
            let handler = Arc::clone(&handler);
            Arc::new(move |ctx: &mut SignalBusContext| handler(ctx, &next))
        })
    }

    /// Register a middleware instance.
    pub fn use_middleware<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        let middleware = Arc::new(middleware);
        let name = middleware.name().to_string();
        self.push(name, move |next: Next| -> Next {
            let middleware = Arc::clone(&middleware);
            Arc::new(move |ctx: &mut SignalBusContext| middleware.handle(ctx, &next))
        })
    }

    /// Register a default-constructed middleware of type `M`.
    pub fn use_default<M>(self) -> Self
    where
        M: Middleware + Default + 'static,
    {
        self.use_middleware(M::default())
    }

    pub fn build(self) -> MiddlewarePipeline {
        MiddlewarePipeline {
            components: Arc::from(self.components),
            names: self.names,
        }
    }

    fn push<F>(mut self, name: String, component: F) -> Self
    where
        F: Fn(Next) -> Next + Send + Sync + 'static,
    {
        self.components.push(Box::new(component));
        self.names.push(name);
        self
    }
}

/// A composed, immutable middleware chain.
#[derive(Clone)]
pub struct MiddlewarePipeline {
    components: Arc<[Component]>,
    names: Vec<String>,
}

impl MiddlewarePipeline {
    /// A pipeline with no middleware; every publish goes straight to delivery.
    pub fn empty() -> Self {
        MiddlewareBuilder::new().build()
    }

    /// Run the chain over `ctx` with a terminal that delivers nowhere; it
    /// only marks the context dispatched if nothing cancelled it.
    pub fn run(&self, ctx: &mut SignalBusContext) -> Result<()> {
        self.run_with(
            ctx,
            Arc::new(|ctx: &mut SignalBusContext| {
                if !ctx.is_cancelled() {
                    ctx.mark_dispatched();
                }
                Ok(())
            }),
        )
    }

    /// Run the chain over `ctx` with `terminal` as the innermost handler.
    pub fn run_with(&self, ctx: &mut SignalBusContext, terminal: Next) -> Result<()> {
        let entry = self
            .components
            .iter()
            .rev()
            .fold(terminal, |next, component| component(next));
        entry(ctx)
    }

    /// Middleware names, outermost first.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middleware", &self.names)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::error::BusError;
    use parking_lot::Mutex;

    #[test]
    fn first_registered_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = MiddlewareBuilder::new();

        for name in ["a", "b", "c"] {
            let log = log.clone();
            builder = builder.use_fn(move |ctx, next| {
                log.lock().push(format!("{name}>"));
                let result = next(ctx);
                log.lock().push(format!("<{name}"));
                result
            });
        }

        let pipeline = builder.build();
        let mut ctx = context(1);
        pipeline.run(&mut ctx).unwrap();

        assert_eq!(*log.lock(), vec!["a>", "b>", "c>", "<c", "<b", "<a"]);
        assert!(ctx.was_dispatched());
    }

    #[test]
    fn skipping_next_short_circuits() {
        let reached = Arc::new(Mutex::new(false));
        let reached_clone = reached.clone();

        let pipeline = MiddlewareBuilder::new()
            .use_fn(|_, _| Ok(()))
            .use_fn(move |ctx, next| {
                *reached_clone.lock() = true;
                next(ctx)
            })
            .build();

        let mut ctx = context(1);
        pipeline.run(&mut ctx).unwrap();

        assert!(!*reached.lock());
        assert!(!ctx.was_dispatched());
    }

    #[test]
    fn middleware_errors_propagate() {
        let pipeline = MiddlewareBuilder::new()
            .use_fn(|_, _| Err(BusError::middleware("broken")))
            .build();

        let mut ctx = context(1);
        let err = pipeline.run(&mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "Middleware error: broken");
    }

    #[test]
    fn empty_pipeline_reaches_terminal() {
        let pipeline = MiddlewarePipeline::empty();
        let mut ctx = context(1);
        pipeline.run(&mut ctx).unwrap();

        assert!(pipeline.is_empty());
        assert!(ctx.was_dispatched());
    }

    #[test]
    fn typed_registration_records_names() {
        let pipeline = MiddlewareBuilder::new()
            .use_default::<LoggingMiddleware>()
            .use_default::<CorrelationIdMiddleware>()
            .build();

        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.names()[0].ends_with("LoggingMiddleware"));
        assert!(pipeline.names()[1].ends_with("CorrelationIdMiddleware"));
    }

    #[test]
    fn outer_middleware_observes_terminal_work() {
        let seen_after_next = Arc::new(Mutex::new(None));
        let seen = seen_after_next.clone();
        let pipeline = MiddlewareBuilder::new()
            .use_fn(move |ctx, next| {
                let result = next(ctx);
                *seen.lock() = ctx.item("delivered").cloned();
                result
            })
            .build();

        let mut ctx = context(1);
        let terminal: Next = Arc::new(|ctx: &mut SignalBusContext| {
            ctx.insert_item("delivered", true);
            Ok(())
        });
        pipeline.run_with(&mut ctx, terminal).unwrap();

        assert_eq!(*seen_after_next.lock(), Some(serde_json::Value::Bool(true)));
    }
}
