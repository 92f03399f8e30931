//! Bus subscription records.

use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;

use super::bus::BusInner;
use super::context::Envelope;
use super::options::SignalBusSubscriptionOptions;
use crate::error::HandlerResult;
use crate::signal::SubscriptionId;

/// Erased sync handler. `None` means the bound target is gone.
pub(crate) type SyncInvoke =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<HandlerResult> + Send + Sync>;

/// Erased async handler. `None` means the bound target is gone.
pub(crate) type AsyncInvoke =
    Arc<dyn Fn(Envelope) -> Option<BoxFuture<'static, HandlerResult>> + Send + Sync>;

pub(crate) enum Handler {
    Sync(SyncInvoke),
    Async(AsyncInvoke),
}

/// How a target-bound handler holds its target.
pub(crate) enum Held<S> {
    Strong(Arc<S>),
    Weak(Weak<S>),
}

impl<S> Held<S> {
    pub(crate) fn get(&self) -> Option<Arc<S>> {
        match self {
            Held::Strong(target) => Some(Arc::clone(target)),
            Held::Weak(target) => target.upgrade(),
        }
    }
}

/// One registered handler, as stored in a bus bucket.
pub(crate) struct Entry {
    pub(crate) id: SubscriptionId,
    pub(crate) message_type: &'static str,
    pub(crate) handler: Handler,
    pub(crate) options: SignalBusSubscriptionOptions,
    /// Set for weakly held targets; the entry dies with the target.
    pub(crate) liveness: Option<Weak<dyn Any + Send + Sync>>,
}

impl Entry {
    pub(crate) fn is_alive(&self) -> bool {
        self.liveness
            .as_ref()
            .map_or(true, |target| target.strong_count() > 0)
    }

    pub(crate) fn is_async(&self) -> bool {
        matches!(self.handler, Handler::Async(_))
    }

    /// Apply the subscription's filter, if any.
    pub(crate) fn accepts(&self, message: &(dyn Any + Send + Sync)) -> bool {
        self.options
            .filter
            .as_ref()
            .map_or(true, |filter| filter.accepts(message))
    }
}

/// A registration on a [`super::SignalBus`].
///
/// The bus owns the subscription; this record identifies it and can remove
/// it. Dropping the record does not unsubscribe. Unsubscribing twice is a
/// no-op.
#[derive(Clone)]
pub struct SignalBusSubscription {
    id: SubscriptionId,
    message_type: &'static str,
    type_id: TypeId,
    is_async: bool,
    is_weak: bool,
    priority: i32,
    bus: Weak<BusInner>,
}

impl SignalBusSubscription {
    pub(crate) fn new(entry: &Entry, type_id: TypeId, bus: Weak<BusInner>) -> Self {
        Self {
            id: entry.id,
            message_type: entry.message_type,
            type_id,
            is_async: entry.is_async(),
            is_weak: entry.liveness.is_some(),
            priority: entry.options.priority,
            bus,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Name of the message type this subscription matches.
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn message_type_id(&self) -> TypeId {
        self.type_id
    }

    /// Whether the handler returns a future.
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Whether the handler's target is held weakly.
    pub fn is_weak(&self) -> bool {
        self.is_weak
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Whether the bus still delivers to this subscription.
    pub fn is_active(&self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.contains(self.type_id, self.id))
    }

    /// Remove the subscription from its bus.
    ///
    /// Returns whether this call removed it.
    pub fn unsubscribe(&self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.remove(Some(self.type_id), self.id))
    }
}

impl std::fmt::Debug for SignalBusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBusSubscription")
            .field("id", &self.id)
            .field("message_type", &self.message_type)
            .field("is_async", &self.is_async)
            .field("is_weak", &self.is_weak)
            .field("priority", &self.priority)
            .finish()
    }
}
