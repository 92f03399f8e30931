//! Subscription records for signals.
//!
//! A subscription binds a unique ID to a delivery action. The five delivery
//! kinds (plain, conditional, typed, weak, weak-typed) share one enum so the
//! notify loop switches on the kind exactly once per delivery.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a subscription.
///
/// IDs come from a process-wide counter and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub(crate) type Action = Arc<dyn Fn() + Send + Sync>;
pub(crate) type ValueAction<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub(crate) type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A delivery target that does not keep its receiver alive.
pub(crate) trait WeakTarget<T>: Send + Sync {
    /// Whether the receiver is still reachable.
    fn is_alive(&self) -> bool;

    /// Invoke the action on the live receiver.
    ///
    /// Returns `false` if the receiver was dropped in the meantime.
    fn invoke(&self, value: &T) -> bool;
}

/// A receiver held through a `Weak` plus the action to run against it.
pub(crate) struct WeakBinding<S, F> {
    target: Weak<S>,
    action: F,
}

impl<S, F> WeakBinding<S, F> {
    pub(crate) fn new(target: &Arc<S>, action: F) -> Self {
        Self {
            target: Arc::downgrade(target),
            action,
        }
    }
}

impl<S, T, F> WeakTarget<T> for WeakBinding<S, F>
where
    S: Send + Sync,
    F: Fn(&S, &T) + Send + Sync,
{
    fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    fn invoke(&self, value: &T) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                (self.action)(&target, value);
                true
            }
            None => false,
        }
    }
}

/// How a subscription receives a notification.
pub(crate) enum Delivery<T> {
    /// Zero-argument action.
    Plain(Action),

    /// Action gated by a predicate over the current value.
    Conditional {
        predicate: Predicate<T>,
        action: ValueAction<T>,
    },

    /// Action receiving the current value.
    Typed(ValueAction<T>),

    /// Zero-argument action on a weakly held receiver.
    Weak(Arc<dyn WeakTarget<T>>),

    /// Value-receiving action on a weakly held receiver.
    WeakTyped(Arc<dyn WeakTarget<T>>),
}

impl<T> Clone for Delivery<T> {
    fn clone(&self) -> Self {
        match self {
            Delivery::Plain(action) => Delivery::Plain(Arc::clone(action)),
            Delivery::Conditional { predicate, action } => Delivery::Conditional {
                predicate: Arc::clone(predicate),
                action: Arc::clone(action),
            },
            Delivery::Typed(action) => Delivery::Typed(Arc::clone(action)),
            Delivery::Weak(target) => Delivery::Weak(Arc::clone(target)),
            Delivery::WeakTyped(target) => Delivery::WeakTyped(Arc::clone(target)),
        }
    }
}

impl<T> Delivery<T> {
    /// Short name of the delivery kind, for logging.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Delivery::Plain(_) => "plain",
            Delivery::Conditional { .. } => "conditional",
            Delivery::Typed(_) => "typed",
            Delivery::Weak(_) => "weak",
            Delivery::WeakTyped(_) => "weak-typed",
        }
    }

    /// Whether this is a weak delivery whose receiver is gone.
    pub(crate) fn is_dead(&self) -> bool {
        match self {
            Delivery::Weak(target) | Delivery::WeakTyped(target) => !target.is_alive(),
            _ => false,
        }
    }

    /// Deliver `value` according to the delivery kind.
    ///
    /// Returns whether the action actually ran.
    pub(crate) fn deliver(&self, value: &T) -> bool {
        match self {
            Delivery::Plain(action) => {
                action();
                true
            }
            Delivery::Conditional { predicate, action } => {
                if predicate(value) {
                    action(value);
                    true
                } else {
                    false
                }
            }
            Delivery::Typed(action) => {
                action(value);
                true
            }
            Delivery::Weak(target) | Delivery::WeakTyped(target) => target.invoke(value),
        }
    }
}

/// A registered subscription.
pub(crate) struct Subscription<T> {
    pub(crate) id: SubscriptionId,
    pub(crate) delivery: Delivery<T>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            delivery: self.delivery.clone(),
        }
    }
}
