//! Observable Signals
//!
//! This module implements the observable value holders: plain signals,
//! typed signals and the async composites built from them.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is an event source. Calling `notify` runs every registered
//! subscription in registration order.
//!
//! ## Typed Signals
//!
//! A [`TypedSignal`] owns a value. Assigning a value that differs from the
//! current one (by `PartialEq`) notifies; assigning an equal value does not.
//!
//! ## Async Signals
//!
//! [`AsyncSignal`] and [`AsyncTypedSignal`] wrap async work with a loading
//! flag and an error slot. Each piece is its own signal, so callers can
//! observe any subset of them.
//!
//! # Subscriptions
//!
//! A subscription is plain, conditional, typed, weak or weak-typed. Weak
//! subscriptions hold their receiver through a `std::sync::Weak`; once the
//! receiver is dropped the subscription goes inert and is pruned the next
//! time the signal notifies.
//!
//! Every `subscribe*` call returns a [`SubscriptionHandle`]. Dropping it
//! unsubscribes, so keep it (or `detach` it) for as long as the
//! subscription should live.

mod async_signal;
mod registry;
#[allow(clippy::module_inception)]
mod signal;
mod subscription;

use std::sync::Arc;

pub use async_signal::{AsyncSignal, AsyncTypedSignal, LoadOutcome};
pub use registry::SubscriptionHandle;
pub use signal::{Signal, TypedSignal};
pub use subscription::SubscriptionId;

/// Common surface of every signal kind.
///
/// Composite signals hand out their constituents as `Arc<dyn Observable>`
/// so callers can subscribe to them without knowing their value types.
pub trait Observable: Send + Sync {
    /// Get the signal's unique ID.
    fn id(&self) -> u64;

    /// Register an action run on every notify.
    fn subscribe_changes(&self, action: Arc<dyn Fn() + Send + Sync>) -> SubscriptionHandle;

    /// Deliver to all live subscriptions. Returns how many actions ran.
    fn notify(&self) -> usize;

    /// Get the number of registered subscriptions.
    fn subscriber_count(&self) -> usize;
}
