//! Signal Implementation
//!
//! A [`Signal`] is an observable event source: `notify` delivers to every
//! live subscription. A [`TypedSignal`] also owns a value and notifies when
//! that value changes.
//!
//! # How Typed Signals Work
//!
//! 1. Subscribers register a plain, typed, conditional or weak action.
//!
//! 2. `set` compares the new value with the current one using `PartialEq`.
//!
//! 3. Only an unequal value is stored and triggers a notify. A direct call
//!    to `notify` always delivers.
//!
//! # Thread Safety
//!
//! Both kinds are cheap to clone; clones share the same value and
//! subscriptions. The value sits behind a `parking_lot::RwLock` and is
//! cloned out before delivery, so handlers may read or set the signal.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::registry::{Registry, SubscriptionHandle};
use super::subscription::{Delivery, SubscriptionId, WeakBinding};
use super::Observable;

/// Counter for generating unique signal IDs.
static SIGNAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique signal ID.
pub(crate) fn next_signal_id() -> u64 {
    SIGNAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An observable event source without a value.
///
/// # Example
///
/// ```rust
/// use pulse_core::signal::Signal;
///
/// let saved = Signal::new();
/// let handle = saved.subscribe(|| println!("saved"));
///
/// saved.notify();
/// handle.dispose();
/// ```
#[derive(Clone)]
pub struct Signal {
    /// Unique identifier for this signal.
    id: u64,

    registry: Arc<Registry<()>>,
}

impl Signal {
    /// Create a new signal with no subscribers.
    pub fn new() -> Self {
        let id = next_signal_id();
        Self {
            id,
            registry: Arc::new(Registry::new(id)),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Register an action run on every notify.
    pub fn subscribe<F>(&self, action: F) -> SubscriptionHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.attach(Delivery::Plain(Arc::new(action)))
    }

    /// Register an action that runs only while `predicate` holds.
    pub fn subscribe_when<P, F>(&self, predicate: P, action: F) -> SubscriptionHandle
    where
        P: Fn() -> bool + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.attach(Delivery::Conditional {
            predicate: Arc::new(move |_: &()| predicate()),
            action: Arc::new(move |_: &()| action()),
        })
    }

    /// Register an action against a receiver that the signal holds weakly.
    ///
    /// Once the last strong reference to `target` is dropped the subscription
    /// goes inert and is pruned on the next notify.
    pub fn subscribe_weak<S, F>(&self, target: &Arc<S>, action: F) -> SubscriptionHandle
    where
        S: Send + Sync + 'static,
        F: Fn(&S) + Send + Sync + 'static,
    {
        let binding = WeakBinding::new(target, move |s: &S, _: &()| action(s));
        self.attach(Delivery::Weak(Arc::new(binding)))
    }

    /// Remove a subscription by ID. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.remove(id)
    }

    /// Deliver to all live subscriptions.
    ///
    /// Returns the number of actions that ran.
    pub fn notify(&self) -> usize {
        self.registry.notify(&())
    }

    /// Get the number of registered subscriptions, dead weak ones included
    /// until the next notify prunes them.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Clear every subscription. Later notifies and subscribes are no-ops.
    pub fn dispose(&self) {
        self.registry.dispose();
    }

    /// Check if the signal has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.registry.is_disposed()
    }

    fn attach(&self, delivery: Delivery<()>) -> SubscriptionHandle {
        let id = self.registry.insert(delivery);
        SubscriptionHandle::new(id, self.registry.clone())
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl Observable for Signal {
    fn id(&self) -> u64 {
        self.id
    }

    fn subscribe_changes(&self, action: Arc<dyn Fn() + Send + Sync>) -> SubscriptionHandle {
        self.attach(Delivery::Plain(action))
    }

    fn notify(&self) -> usize {
        Signal::notify(self)
    }

    fn subscriber_count(&self) -> usize {
        Signal::subscriber_count(self)
    }
}

/// An observable value of type T.
///
/// # Type Parameters
///
/// - `T`: The stored value. `PartialEq` decides whether an assignment is a
///   change.
///
/// # Example
///
/// ```rust
/// use pulse_core::signal::TypedSignal;
///
/// let count = TypedSignal::new(0);
/// let handle = count.subscribe_value(|v| println!("count = {v}"));
///
/// assert!(count.set(5));   // notifies
/// assert!(!count.set(5));  // same value, no notify
/// handle.dispose();
/// ```
pub struct TypedSignal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Unique identifier for this signal.
    id: u64,

    /// The current value, protected by RwLock for thread safety.
    value: Arc<RwLock<T>>,

    registry: Arc<Registry<T>>,
}

impl<T> TypedSignal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        let id = next_signal_id();
        Self {
            id,
            value: Arc::new(RwLock::new(value)),
            registry: Arc::new(Registry::new(id)),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get a clone of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    /// Store a new value, notifying only if it differs from the current one.
    ///
    /// Returns whether a notify happened.
    pub fn set(&self, value: T) -> bool {
        self.update(move |_| value)
    }

    /// Store a new value without notifying anyone.
    pub fn set_silently(&self, value: T) {
        *self.value.write() = value;
    }

    /// Update the value using a function.
    ///
    /// Same change rule as [`TypedSignal::set`]. `f` runs under the value's
    /// write lock, so it must not touch this signal. Subscribers receive the
    /// value this call stored, even if another thread stores a newer one
    /// before they run.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        let stored = {
            let mut guard = self.value.write();
            let next = f(&guard);
            if *guard == next {
                return false;
            }
            *guard = next;
            guard.clone()
        };
        self.registry.notify(&stored);
        true
    }

    /// Register an action run on every notify, ignoring the value.
    pub fn subscribe<F>(&self, action: F) -> SubscriptionHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.attach(Delivery::Plain(Arc::new(action)))
    }

    /// Register an action receiving the current value.
    pub fn subscribe_value<F>(&self, action: F) -> SubscriptionHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.attach(Delivery::Typed(Arc::new(action)))
    }

    /// Register an action that runs only when `predicate` accepts the value.
    pub fn subscribe_when<P, F>(&self, predicate: P, action: F) -> SubscriptionHandle
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.attach(Delivery::Conditional {
            predicate: Arc::new(predicate),
            action: Arc::new(action),
        })
    }

    /// Register a value-less action against a weakly held receiver.
    pub fn subscribe_weak<S, F>(&self, target: &Arc<S>, action: F) -> SubscriptionHandle
    where
        S: Send + Sync + 'static,
        F: Fn(&S) + Send + Sync + 'static,
    {
        let binding = WeakBinding::new(target, move |s: &S, _: &T| action(s));
        self.attach(Delivery::Weak(Arc::new(binding)))
    }

    /// Register a value-receiving action against a weakly held receiver.
    pub fn subscribe_weak_value<S, F>(&self, target: &Arc<S>, action: F) -> SubscriptionHandle
    where
        S: Send + Sync + 'static,
        F: Fn(&S, &T) + Send + Sync + 'static,
    {
        self.attach(Delivery::WeakTyped(Arc::new(WeakBinding::new(target, action))))
    }

    /// Remove a subscription by ID. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.remove(id)
    }

    /// Deliver the current value to all live subscriptions, changed or not.
    ///
    /// Returns the number of actions that ran.
    pub fn notify(&self) -> usize {
        let value = self.get();
        self.registry.notify(&value)
    }

    /// Get the number of registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Clear every subscription. The value stays readable.
    pub fn dispose(&self) {
        self.registry.dispose();
    }

    /// Check if the signal has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.registry.is_disposed()
    }

    fn attach(&self, delivery: Delivery<T>) -> SubscriptionHandle {
        let id = self.registry.insert(delivery);
        SubscriptionHandle::new(id, self.registry.clone())
    }
}

impl<T> Clone for TypedSignal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for TypedSignal<T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Debug for TypedSignal<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedSignal")
            .field("id", &self.id)
            .field("value", &self.get())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl<T> Observable for TypedSignal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn subscribe_changes(&self, action: Arc<dyn Fn() + Send + Sync>) -> SubscriptionHandle {
        self.attach(Delivery::Plain(action))
    }

    fn notify(&self) -> usize {
        TypedSignal::notify(self)
    }

    fn subscriber_count(&self) -> usize {
        TypedSignal::subscriber_count(self)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
