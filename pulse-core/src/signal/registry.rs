//! Subscription registry and the notify algorithm.
//!
//! # Notify
//!
//! 1. Prune weak subscriptions whose receiver has been dropped.
//! 2. Snapshot the remaining subscriptions under a read lock.
//! 3. Release the lock and deliver to each snapshot entry in order.
//!
//! No lock is held while user code runs. A handler may subscribe,
//! unsubscribe or notify re-entrantly; additions are seen by the next
//! notify, and a removal does not cancel a delivery already in the snapshot.
//!
//! # Thread Safety
//!
//! The subscription list sits behind a `parking_lot::RwLock`. Snapshots keep
//! each notification internally consistent but overlapping notifications
//! from different threads are not ordered relative to each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::subscription::{Delivery, Subscription, SubscriptionId};

/// Snapshot buffer; most signals have only a handful of subscribers.
type Snapshot<T> = SmallVec<[Subscription<T>; 8]>;

/// Anything a [`SubscriptionHandle`] can remove itself from.
pub(crate) trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Ordered subscription list shared by every signal kind.
pub(crate) struct Registry<T> {
    signal_id: u64,
    entries: RwLock<Vec<Subscription<T>>>,
    disposed: AtomicBool,
}

impl<T> Registry<T>
where
    T: 'static,
{
    pub(crate) fn new(signal_id: u64) -> Self {
        Self {
            signal_id,
            entries: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Append a subscription. Insertion order is delivery order.
    pub(crate) fn insert(&self, delivery: Delivery<T>) -> SubscriptionId {
        let id = SubscriptionId::new();
        let kind = delivery.kind();

        {
            // `dispose` sets the flag before clearing under this lock.
            let mut entries = self.entries.write();
            if self.is_disposed() {
                drop(entries);
                warn!(signal_id = self.signal_id, "Subscribe on disposed signal ignored");
                return id;
            }
            entries.push(Subscription { id, delivery });
        }

        trace!(signal_id = self.signal_id, subscription = %id, kind, "Subscribed");
        id
    }

    /// Remove exactly one subscription. Returns whether it was present.
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let Some(pos) = entries.iter().position(|s| s.id == id) else {
            return false;
        };
        entries.remove(pos);
        trace!(signal_id = self.signal_id, subscription = %id, "Unsubscribed");
        true
    }

    /// Deliver `value` to every live subscription.
    ///
    /// Returns the number of actions that ran. A panicking action unwinds
    /// out of this call and later subscriptions are not reached.
    pub(crate) fn notify(&self, value: &T) -> usize {
        if self.is_disposed() {
            return 0;
        }

        self.prune();

        let snapshot: Snapshot<T> = self.entries.read().iter().cloned().collect();
        trace!(
            signal_id = self.signal_id,
            subscribers = snapshot.len(),
            "Notifying"
        );

        let mut delivered = 0;
        for sub in &snapshot {
            if sub.delivery.deliver(value) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop weak subscriptions whose receiver is gone.
    pub(crate) fn prune(&self) -> usize {
        if !self.entries.read().iter().any(|s| s.delivery.is_dead()) {
            return 0;
        }

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|s| !s.delivery.is_dead());
        let pruned = before - entries.len();

        if pruned > 0 {
            debug!(signal_id = self.signal_id, pruned, "Pruned dead weak subscriptions");
        }
        pruned
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Clear all subscriptions and refuse new ones.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleared = {
            let mut entries = self.entries.write();
            let n = entries.len();
            entries.clear();
            n
        };
        debug!(signal_id = self.signal_id, cleared, "Signal disposed");
    }
}

impl<T> Unsubscribe for Registry<T>
where
    T: 'static,
    Subscription<T>: Send + Sync,
{
    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.remove(id)
    }
}

/// Handle to a signal subscription.
///
/// Dropping or disposing the handle removes exactly that subscription. Use
/// [`SubscriptionHandle::detach`] to keep the subscription alive for the
/// signal's lifetime.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    owner: Option<Weak<dyn Unsubscribe>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriptionId, owner: Arc<dyn Unsubscribe>) -> Self {
        Self {
            id,
            owner: Some(Arc::downgrade(&owner)),
        }
    }

    /// Get the subscription's unique ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the subscription now.
    ///
    /// Returns whether it was still registered.
    pub fn dispose(mut self) -> bool {
        self.release()
    }

    /// Keep the subscription registered after this handle is gone.
    ///
    /// The returned ID can still be passed to the signal's `unsubscribe`.
    pub fn detach(mut self) -> SubscriptionId {
        self.owner = None;
        self.id
    }

    fn release(&mut self) -> bool {
        match self.owner.take().and_then(|owner| owner.upgrade()) {
            Some(owner) => owner.unsubscribe(self.id),
            None => false,
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("attached", &self.owner.is_some())
            .finish()
    }
}
