//! Per-subscription delivery policy.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A predicate deciding whether a subscription sees a message.
///
/// Built for one message type; the bus only consults it for that type.
#[derive(Clone)]
pub struct MessageFilter {
    type_id: TypeId,
    type_name: &'static str,
    predicate: Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>,
}

impl MessageFilter {
    /// Wrap a predicate over messages of type `M`.
    pub fn new<M, F>(predicate: F) -> Self
    where
        M: Send + Sync + 'static,
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            predicate: Arc::new(move |message: &(dyn Any + Send + Sync)| {
                message.downcast_ref::<M>().is_some_and(|m| predicate(m))
            }),
        }
    }

    /// Whether this filter was built for messages of type `M`.
    pub fn applies_to<M: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn accepts(&self, message: &(dyn Any + Send + Sync)) -> bool {
        (self.predicate)(message)
    }
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFilter")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Delivery policy for one bus subscription.
///
/// Durations are written as milliseconds in serialized form. The filter is
/// code-only and never serialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalBusSubscriptionOptions {
    /// Hold the handler's target weakly. Only meaningful for target-bound
    /// subscriptions (`subscribe_weak*`).
    pub use_weak_reference: bool,

    /// Run the handler off the publishing path.
    pub run_in_background: bool,

    /// Extra attempts after a failed delivery.
    pub max_retries: u32,

    /// Pause between attempts.
    #[serde(with = "millis")]
    pub retry_delay: Duration,

    /// Higher priorities are delivered first.
    pub priority: i32,

    /// Deliveries running longer than this count as failed.
    #[serde(with = "opt_millis")]
    pub timeout: Option<Duration>,

    #[serde(skip)]
    pub filter: Option<MessageFilter>,
}

impl SignalBusSubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Only deliver messages accepted by `predicate`.
    pub fn with_filter<M, F>(mut self, predicate: F) -> Self
    where
        M: Send + Sync + 'static,
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(MessageFilter::new(predicate));
        self
    }

    /// Retry a failed delivery up to `max_retries` times, `delay` apart.
    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn in_background(mut self) -> Self {
        self.run_in_background = true;
        self
    }

    pub fn weak(mut self) -> Self {
        self.use_weak_reference = true;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u32);
    struct Pong;

    #[test]
    fn filter_only_accepts_its_type() {
        let filter = MessageFilter::new(|p: &Ping| p.0 > 1);

        assert!(filter.applies_to::<Ping>());
        assert!(!filter.applies_to::<Pong>());
        assert!(filter.accepts(&Ping(2)));
        assert!(!filter.accepts(&Ping(1)));
        assert!(!filter.accepts(&Pong));
    }

    #[test]
    fn options_builder() {
        let options = SignalBusSubscriptionOptions::new()
            .with_priority(10)
            .with_retries(3, Duration::from_millis(20))
            .with_timeout(Duration::from_secs(1))
            .in_background()
            .weak();

        assert_eq!(options.priority, 10);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.retry_delay, Duration::from_millis(20));
        assert_eq!(options.timeout, Some(Duration::from_secs(1)));
        assert!(options.run_in_background);
        assert!(options.use_weak_reference);
    }

    #[test]
    fn options_deserialize_from_millis() {
        let options: SignalBusSubscriptionOptions =
            serde_json::from_str(r#"{"priority": 5, "retry_delay": 250, "timeout": 1000}"#)
                .unwrap();

        assert_eq!(options.priority, 5);
        assert_eq!(options.retry_delay, Duration::from_millis(250));
        assert_eq!(options.timeout, Some(Duration::from_millis(1000)));
        assert_eq!(options.max_retries, 0);
        assert!(options.filter.is_none());
    }
}
