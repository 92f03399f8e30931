//! Observational records produced by the bus: failure reports and counters.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::context::Envelope;
use crate::error::BusError;
use crate::signal::SubscriptionId;

/// One captured delivery failure.
#[derive(Clone)]
pub struct SignalBusErrorContext {
    message: Envelope,
    pub message_type: &'static str,
    pub error: BusError,
    pub subscription_id: SubscriptionId,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Whether the failing handler was async or ran in the background.
    pub is_async: bool,
}

impl SignalBusErrorContext {
    pub(crate) fn new(
        message: Envelope,
        message_type: &'static str,
        error: BusError,
        subscription_id: SubscriptionId,
        correlation_id: Option<String>,
        is_async: bool,
    ) -> Self {
        Self {
            message,
            message_type,
            error,
            subscription_id,
            correlation_id,
            timestamp: Utc::now(),
            is_async,
        }
    }

    /// Borrow the failed message as `M`, if that is its type.
    pub fn message<M: 'static>(&self) -> Option<&M> {
        self.message.downcast_ref::<M>()
    }
}

impl std::fmt::Debug for SignalBusErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBusErrorContext")
            .field("message_type", &self.message_type)
            .field("error", &self.error)
            .field("subscription_id", &self.subscription_id)
            .field("correlation_id", &self.correlation_id)
            .field("timestamp", &self.timestamp)
            .field("is_async", &self.is_async)
            .finish()
    }
}

/// Point-in-time counters since the bus was created.
#[derive(Debug, Clone, Serialize)]
pub struct SignalBusStatistics {
    pub total_published: u64,
    pub total_errors: u64,
    pub active_subscriptions: usize,
    pub published_by_type: BTreeMap<String, u64>,
    pub errors_by_type: BTreeMap<String, u64>,
    pub subscriptions_by_type: BTreeMap<String, usize>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct TypeCounters {
    published: AtomicU64,
    errors: AtomicU64,
}

/// Lock-light counters plus a bounded history of recent failures.
pub(crate) struct StatsCollector {
    created_at: DateTime<Utc>,
    total_published: AtomicU64,
    total_errors: AtomicU64,
    by_type: DashMap<&'static str, TypeCounters>,
    history: Mutex<VecDeque<Arc<SignalBusErrorContext>>>,
    history_limit: usize,
}

impl StatsCollector {
    pub(crate) fn new(history_limit: usize) -> Self {
        Self {
            created_at: Utc::now(),
            total_published: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            by_type: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(history_limit.min(64))),
            history_limit,
        }
    }

    pub(crate) fn record_publish(&self, message_type: &'static str) {
        self.total_published.fetch_add(1, Ordering::Relaxed);
        self.by_type
            .entry(message_type)
            .or_default()
            .published
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, error: Arc<SignalBusErrorContext>) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.by_type
            .entry(error.message_type)
            .or_default()
            .errors
            .fetch_add(1, Ordering::Relaxed);

        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(error);
    }

    pub(crate) fn recent_errors(&self) -> Vec<Arc<SignalBusErrorContext>> {
        self.history.lock().iter().cloned().collect()
    }

    pub(crate) fn snapshot(&self, subscriptions_by_type: BTreeMap<String, usize>) -> SignalBusStatistics {
        let mut published_by_type = BTreeMap::new();
        let mut errors_by_type = BTreeMap::new();
        for entry in self.by_type.iter() {
            let name = entry.key().to_string();
            published_by_type.insert(name.clone(), entry.published.load(Ordering::Relaxed));
            errors_by_type.insert(name, entry.errors.load(Ordering::Relaxed));
        }

        SignalBusStatistics {
            total_published: self.total_published.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            active_subscriptions: subscriptions_by_type.values().sum(),
            published_by_type,
            errors_by_type,
            subscriptions_by_type,
            created_at: self.created_at,
        }
    }
}
