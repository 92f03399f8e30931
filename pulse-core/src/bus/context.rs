//! The envelope that carries one published message through the middleware
//! pipeline.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A type-erased published message.
pub(crate) type Envelope = Arc<dyn Any + Send + Sync>;

/// Which publish entry point created the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMethod {
    Publish,
    PublishAsync,
}

impl PublishMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishMethod::Publish => "publish",
            PublishMethod::PublishAsync => "publish_async",
        }
    }
}

impl fmt::Display for PublishMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-publish state handed to every middleware.
///
/// A fresh context is built for each publish call and dropped when the call
/// returns. Middleware can read the message, stash values for later
/// middleware in the item map, or cancel delivery with
/// [`SignalBusContext::cancel`].
pub struct SignalBusContext {
    message: Envelope,
    message_type: &'static str,
    type_id: TypeId,
    method: PublishMethod,
    correlation_id: Option<String>,
    items: IndexMap<String, Value>,
    cancellation: CancellationToken,
    is_cancelled: bool,
    subscriber_count: usize,
    started_at: DateTime<Utc>,
    /// Set when the innermost handler of the pipeline delivers.
    dispatched: bool,
}

impl SignalBusContext {
    pub(crate) fn new<M>(
        message: Arc<M>,
        method: PublishMethod,
        correlation_id: Option<String>,
        cancellation: CancellationToken,
    ) -> Self
    where
        M: Send + Sync + 'static,
    {
        Self {
            message,
            message_type: std::any::type_name::<M>(),
            type_id: TypeId::of::<M>(),
            method,
            correlation_id,
            items: IndexMap::new(),
            cancellation,
            is_cancelled: false,
            subscriber_count: 0,
            started_at: Utc::now(),
            dispatched: false,
        }
    }

    /// Borrow the message as `M`, if that is its type.
    pub fn message<M: 'static>(&self) -> Option<&M> {
        self.message.downcast_ref::<M>()
    }

    pub(crate) fn envelope(&self) -> &Envelope {
        &self.message
    }

    /// The message's type name.
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn message_type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn method(&self) -> PublishMethod {
        self.method
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, id: impl Into<String>) {
        self.correlation_id = Some(id.into());
    }

    /// Number of subscriptions registered for the message type when the
    /// publish started.
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    pub(crate) fn set_subscriber_count(&mut self, count: usize) {
        self.subscriber_count = count;
    }

    /// When the publish started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The caller's cancellation token for this publish.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Skip delivery to subscribers. Middleware that have not run yet still
    /// run if the caller continues the chain.
    pub fn cancel(&mut self) {
        self.is_cancelled = true;
    }

    /// Whether delivery was cancelled by middleware or by the caller's token.
    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled || self.cancellation.is_cancelled()
    }

    /// Store a value for later middleware.
    pub fn insert_item(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.items.insert(key.into(), value.into());
    }

    pub fn item(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    pub fn remove_item(&mut self, key: &str) -> Option<Value> {
        self.items.shift_remove(key)
    }

    /// All stored items in insertion order.
    pub fn items(&self) -> &IndexMap<String, Value> {
        &self.items
    }

    pub(crate) fn mark_dispatched(&mut self) {
        self.dispatched = true;
    }

    /// Whether subscriber delivery has run for this publish.
    ///
    /// Middleware sees `true` after its `next` returns unless something
    /// short-circuited or cancelled the publish first.
    pub fn was_dispatched(&self) -> bool {
        self.dispatched
    }
}

impl fmt::Debug for SignalBusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBusContext")
            .field("message_type", &self.message_type)
            .field("method", &self.method)
            .field("correlation_id", &self.correlation_id)
            .field("subscriber_count", &self.subscriber_count)
            .field("is_cancelled", &self.is_cancelled())
            .field("items", &self.items)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Ping(u8);

    fn context() -> SignalBusContext {
        SignalBusContext::new(
            Arc::new(Ping(1)),
            PublishMethod::Publish,
            None,
            CancellationToken::new(),
        )
    }

    #[test]
    fn context_exposes_typed_message() {
        let ctx = context();
        assert_eq!(ctx.message::<Ping>(), Some(&Ping(1)));
        assert_eq!(ctx.message::<String>(), None);
        assert!(ctx.message_type().ends_with("Ping"));
    }

    #[test]
    fn context_items_keep_insertion_order() {
        let mut ctx = context();
        ctx.insert_item("b", 2);
        ctx.insert_item("a", "one");

        let keys: Vec<_> = ctx.items().keys().cloned().collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(ctx.item("a"), Some(&Value::from("one")));
        assert_eq!(ctx.remove_item("b"), Some(Value::from(2)));
    }

    #[test]
    fn dispatch_flag_survives_late_cancel() {
        let mut ctx = context();
        assert!(!ctx.was_dispatched());

        ctx.mark_dispatched();
        assert!(ctx.was_dispatched());

        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.was_dispatched());
    }

    #[test]
    fn caller_token_cancels_context() {
        let token = CancellationToken::new();
        let ctx = SignalBusContext::new(
            Arc::new(Ping(1)),
            PublishMethod::PublishAsync,
            Some("abc".into()),
            token.clone(),
        );

        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.correlation_id(), Some("abc"));
    }
}
