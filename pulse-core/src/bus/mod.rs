//! Typed Message Bus
//!
//! Decoupled publish/subscribe keyed by message type. Any `Send + Sync +
//! 'static` type can be a message; handlers receive exactly the type they
//! subscribed to.
//!
//! Each subscription carries [`SignalBusSubscriptionOptions`]: priority,
//! filter, retries, timeout, background execution and weak target binding.
//! Every publish passes through the bus's [`MiddlewarePipeline`] first.
//!
//! A failing subscriber never affects the publisher or other subscribers.
//! Its failure is recorded as a [`SignalBusErrorContext`], counted in
//! [`SignalBusStatistics`], and passed to the bus's error hook.

#[allow(clippy::module_inception)]
mod bus;
mod context;
pub mod middleware;
mod options;
mod stats;
mod subscription;

pub use bus::{PublishReport, SignalBus, SignalBusBuilder};
pub use context::{PublishMethod, SignalBusContext};
pub use middleware::{
    CorrelationIdMiddleware, ExceptionHandlingMiddleware, LoggingMiddleware, Middleware,
    MiddlewareBuilder, MiddlewarePipeline, Next, ValidationMiddleware, VALIDATION_FAILED_KEY,
};
pub use options::{MessageFilter, SignalBusSubscriptionOptions};
pub use stats::{SignalBusErrorContext, SignalBusStatistics};
pub use subscription::SignalBusSubscription;
