//! Signal Bus
//!
//! Typed publish/subscribe. Subscriptions are bucketed by message type and
//! kept in descending priority order, ties in registration order.
//!
//! # How a Publish Works
//!
//! 1. Dead weak subscriptions for the type are pruned and the rest are
//!    snapshotted.
//!
//! 2. A fresh [`SignalBusContext`] runs through the middleware pipeline.
//!    A middleware error is returned to the publisher.
//!
//! 3. The innermost handler of the pipeline delivers, unless the context is
//!    cancelled by then. Each snapshot entry goes through its filter, then
//!    background hand-off, then the handler with retries and timeout. When
//!    a middleware's `next` returns, delivery has finished.
//!
//! 4. A failing subscriber is recorded (statistics, recent errors, error
//!    hook) and delivery continues with the next one.
//!
//! # Sync and Async Paths
//!
//! `publish` never blocks on a future. Async handlers reached from it are
//! spawned on the ambient tokio runtime like background handlers.
//! `publish_async` awaits async handlers in priority order. Middleware is
//! synchronous, so when a pipeline is installed `publish_async` runs it on
//! a blocking thread that waits for delivery on the ambient runtime.
//!
//! Sync handlers cannot be pre-empted, so their timeout is checked after
//! they return.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::context::{Envelope, PublishMethod, SignalBusContext};
use super::middleware::{panic_message, MiddlewareBuilder, MiddlewarePipeline, Next};
use super::options::SignalBusSubscriptionOptions;
use super::stats::{SignalBusErrorContext, SignalBusStatistics, StatsCollector};
use super::subscription::{AsyncInvoke, Entry, Handler, Held, SignalBusSubscription, SyncInvoke};
use crate::config::SignalBusConfig;
use crate::error::{BusError, HandlerError, HandlerResult, Result};
use crate::signal::SubscriptionId;

type ErrorHook = Arc<dyn Fn(&SignalBusErrorContext) + Send + Sync>;

/// What happened to one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub message_type: &'static str,
    pub correlation_id: Option<String>,
    /// Subscriptions registered for the type when the publish started.
    pub subscriber_count: usize,
    /// Handlers that ran to completion on the publishing path.
    pub delivered: usize,
    /// Subscriptions skipped by their filter.
    pub filtered: usize,
    /// Handlers that failed after exhausting retries.
    pub failed: usize,
    /// Handlers handed off to run without the publisher waiting.
    pub backgrounded: usize,
    /// Delivery never ran: middleware short-circuited, or the context was
    /// cancelled before the pipeline reached it.
    pub cancelled: bool,
}

impl PublishReport {
    /// Fill in what the context knows once the pipeline has returned.
    fn finish(mut self, ctx: &SignalBusContext) -> Self {
        self.message_type = ctx.message_type();
        self.correlation_id = ctx.correlation_id().map(str::to_owned);
        self.subscriber_count = ctx.subscriber_count();
        self.cancelled = !ctx.was_dispatched();
        self
    }
}

/// Result of a single handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invocation {
    Delivered,
    /// The weakly held target was dropped; nothing ran.
    TargetDropped,
}

/// The message and correlation ID a delivery belongs to.
#[derive(Clone)]
struct DeliverySite {
    message: Envelope,
    correlation_id: Option<String>,
}

impl DeliverySite {
    fn from_context(ctx: &SignalBusContext) -> Self {
        Self {
            message: Arc::clone(ctx.envelope()),
            correlation_id: ctx.correlation_id().map(str::to_owned),
        }
    }
}

pub(crate) struct BusInner {
    buckets: DashMap<TypeId, Vec<Arc<Entry>>>,
    pipeline: MiddlewarePipeline,
    stats: StatsCollector,
    config: SignalBusConfig,
    on_error: Option<ErrorHook>,
}

/// A typed message bus.
///
/// Cheap to clone; clones share subscriptions, pipeline and statistics.
///
/// # Example
///
/// ```rust
/// use pulse_core::bus::SignalBus;
///
/// #[derive(Debug)]
/// struct OrderPlaced { id: u32 }
///
/// let bus = SignalBus::new();
/// let sub = bus.subscribe(|order: &OrderPlaced| {
///     println!("order {}", order.id);
///     Ok(())
/// });
///
/// let report = bus.publish(OrderPlaced { id: 7 }).unwrap();
/// assert_eq!(report.delivered, 1);
/// assert!(sub.unsubscribe());
/// ```
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

/// Configures a [`SignalBus`] before it starts publishing.
#[derive(Default)]
pub struct SignalBusBuilder {
    config: SignalBusConfig,
    pipeline: MiddlewarePipeline,
    on_error: Option<ErrorHook>,
}

impl SignalBusBuilder {
    pub fn config(mut self, config: SignalBusConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already built pipeline.
    pub fn pipeline(mut self, pipeline: MiddlewarePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Build the pipeline in place.
    pub fn middleware<F>(self, configure: F) -> Self
    where
        F: FnOnce(MiddlewareBuilder) -> MiddlewareBuilder,
    {
        let pipeline = configure(MiddlewareBuilder::new()).build();
        self.pipeline(pipeline)
    }

    /// Called with every captured subscriber failure.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SignalBusErrorContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> SignalBus {
        SignalBus {
            inner: Arc::new(BusInner {
                buckets: DashMap::new(),
                stats: StatsCollector::new(self.config.error_history),
                pipeline: self.pipeline,
                config: self.config,
                on_error: self.on_error,
            }),
        }
    }
}

impl SignalBus {
    /// Create a bus with default configuration and no middleware.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SignalBusBuilder {
        SignalBusBuilder::default()
    }

    pub fn with_config(config: SignalBusConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &SignalBusConfig {
        &self.inner.config
    }

    pub fn pipeline(&self) -> &MiddlewarePipeline {
        &self.inner.pipeline
    }

    // --- Subscribing ---

    /// Subscribe a sync handler with the configured default options.
    pub fn subscribe<M, F>(&self, handler: F) -> SignalBusSubscription
    where
        M: Send + Sync + 'static,
        F: Fn(&M) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_with(handler, self.inner.config.default_options.clone())
    }

    /// Subscribe a sync handler with explicit options.
    ///
    /// A closure has no separate target, so `use_weak_reference` is ignored
    /// here; use [`SignalBus::subscribe_weak`] to bind a weakly held target.
    pub fn subscribe_with<M, F>(
        &self,
        handler: F,
        options: SignalBusSubscriptionOptions,
    ) -> SignalBusSubscription
    where
        M: Send + Sync + 'static,
        F: Fn(&M) -> HandlerResult + Send + Sync + 'static,
    {
        warn_unbound_weak::<M>(&options);
        let invoke: SyncInvoke = Arc::new(move |message: &(dyn Any + Send + Sync)| {
            Some(match message.downcast_ref::<M>() {
                Some(message) => handler(message),
                None => Err(type_mismatch::<M>()),
            })
        });
        self.register::<M>(Handler::Sync(invoke), options, None)
    }

    /// Subscribe an async handler with the configured default options.
    pub fn subscribe_async<M, F, Fut>(&self, handler: F) -> SignalBusSubscription
    where
        M: Send + Sync + 'static,
        F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_async_with(handler, self.inner.config.default_options.clone())
    }

    /// Subscribe an async handler with explicit options.
    pub fn subscribe_async_with<M, F, Fut>(
        &self,
        handler: F,
        options: SignalBusSubscriptionOptions,
    ) -> SignalBusSubscription
    where
        M: Send + Sync + 'static,
        F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        warn_unbound_weak::<M>(&options);
        let invoke: AsyncInvoke = Arc::new(move |message: Envelope| {
            Some(match message.downcast::<M>() {
                Ok(message) => handler(message).boxed(),
                Err(_) => async { Err::<(), _>(type_mismatch::<M>()) }.boxed(),
            })
        });
        self.register::<M>(Handler::Async(invoke), options, None)
    }

    /// Subscribe a sync handler bound to `target`.
    ///
    /// With `use_weak_reference` the bus holds `target` weakly: once every
    /// other owner drops it, deliveries become no-ops and the subscription
    /// is pruned. Otherwise the bus keeps `target` alive until unsubscribed.
    pub fn subscribe_weak<M, S, F>(
        &self,
        target: &Arc<S>,
        handler: F,
        options: SignalBusSubscriptionOptions,
    ) -> SignalBusSubscription
    where
        M: Send + Sync + 'static,
        S: Send + Sync + 'static,
        F: Fn(&S, &M) -> HandlerResult + Send + Sync + 'static,
    {
        let (held, liveness) = hold(target, options.use_weak_reference);
        let invoke: SyncInvoke = Arc::new(move |message: &(dyn Any + Send + Sync)| {
            let target = held.get()?;
            Some(match message.downcast_ref::<M>() {
                Some(message) => handler(&target, message),
                None => Err(type_mismatch::<M>()),
            })
        });
        self.register::<M>(Handler::Sync(invoke), options, liveness)
    }

    /// Subscribe an async handler bound to `target`. See
    /// [`SignalBus::subscribe_weak`] for how the target is held.
    pub fn subscribe_weak_async<M, S, F, Fut>(
        &self,
        target: &Arc<S>,
        handler: F,
        options: SignalBusSubscriptionOptions,
    ) -> SignalBusSubscription
    where
        M: Send + Sync + 'static,
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let (held, liveness) = hold(target, options.use_weak_reference);
        let invoke: AsyncInvoke = Arc::new(move |message: Envelope| {
            let target = held.get()?;
            Some(match message.downcast::<M>() {
                Ok(message) => handler(target, message).boxed(),
                Err(_) => async { Err::<(), _>(type_mismatch::<M>()) }.boxed(),
            })
        });
        self.register::<M>(Handler::Async(invoke), options, liveness)
    }

    /// Remove a subscription by ID. Unknown IDs are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(None, id)
    }

    /// Async form of [`SignalBus::unsubscribe`].
    pub async fn unsubscribe_async(&self, id: SubscriptionId) -> bool {
        self.unsubscribe(id)
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        self.inner.buckets.clear();
        debug!("All bus subscriptions cleared");
    }

    /// Number of live subscriptions for messages of type `M`.
    pub fn subscriber_count<M: 'static>(&self) -> usize {
        self.inner.live_entries(TypeId::of::<M>()).len()
    }

    fn register<M: 'static>(
        &self,
        handler: Handler,
        options: SignalBusSubscriptionOptions,
        liveness: Option<Weak<dyn Any + Send + Sync>>,
    ) -> SignalBusSubscription {
        let message_type = std::any::type_name::<M>();
        if let Some(filter) = &options.filter {
            if !filter.applies_to::<M>() {
                warn!(
                    message_type,
                    filter_type = filter.type_name(),
                    "Filter built for another message type rejects every message"
                );
            }
        }

        let type_id = TypeId::of::<M>();
        let entry = Arc::new(Entry {
            id: SubscriptionId::new(),
            message_type,
            handler,
            options,
            liveness,
        });

        {
            let mut bucket = self.inner.buckets.entry(type_id).or_default();
            let priority = entry.options.priority;
            let pos = bucket
                .iter()
                .position(|e| e.options.priority < priority)
                .unwrap_or(bucket.len());
            bucket.insert(pos, Arc::clone(&entry));
        }

        debug!(
            message_type,
            subscription = %entry.id,
            priority = entry.options.priority,
            is_async = entry.is_async(),
            weak = entry.liveness.is_some(),
            "Bus subscription registered"
        );
        SignalBusSubscription::new(&entry, type_id, Arc::downgrade(&self.inner))
    }

    // --- Publishing ---

    /// Publish on the calling thread.
    ///
    /// Returns an error only if a middleware fails; subscriber failures are
    /// recorded and counted in the report.
    pub fn publish<M>(&self, message: M) -> Result<PublishReport>
    where
        M: Send + Sync + 'static,
    {
        self.publish_blocking(message, None)
    }

    /// Publish with a caller-chosen correlation ID.
    pub fn publish_with<M>(&self, message: M, correlation_id: impl Into<String>) -> Result<PublishReport>
    where
        M: Send + Sync + 'static,
    {
        self.publish_blocking(message, Some(correlation_id.into()))
    }

    /// Publish and await async handlers in priority order.
    ///
    /// Must run inside a tokio runtime when a middleware pipeline is
    /// installed or handlers use timeouts, retry delays or background
    /// execution.
    pub async fn publish_async<M>(&self, message: M) -> Result<PublishReport>
    where
        M: Send + Sync + 'static,
    {
        self.publish_async_with_cancel(message, CancellationToken::new())
            .await
    }

    /// Like [`SignalBus::publish_async`], carrying the caller's token in the
    /// context. A token cancelled before delivery starts skips delivery.
    pub async fn publish_async_with_cancel<M>(
        &self,
        message: M,
        cancellation: CancellationToken,
    ) -> Result<PublishReport>
    where
        M: Send + Sync + 'static,
    {
        let (mut ctx, entries) =
            self.inner
                .prepare(message, PublishMethod::PublishAsync, None, cancellation);

        if self.inner.pipeline.is_empty() {
            let mut report = PublishReport::default();
            if let Some(site) = begin_delivery(&mut ctx) {
                self.inner.deliver_async(&entries, &site, &mut report).await;
            }
            return Ok(report.finish(&ctx));
        }

        // Middleware is synchronous, so the chain runs on a blocking thread
        // and its terminal drives async delivery on the ambient runtime.
        let runtime =
            Handle::try_current().map_err(|_| BusError::NoRuntime(ctx.message_type()))?;
        let inner = Arc::clone(&self.inner);
        let joined = tokio::task::spawn_blocking(move || {
            let report = Arc::new(Mutex::new(PublishReport::default()));
            let terminal = inner.async_terminal(entries, Arc::clone(&report), runtime);
            let result = inner.pipeline.run_with(&mut ctx, terminal);
            let report = std::mem::take(&mut *report.lock());
            result.map(|()| report.finish(&ctx))
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(BusError::Configuration(err.to_string())),
        }
    }

    fn publish_blocking<M>(&self, message: M, correlation_id: Option<String>) -> Result<PublishReport>
    where
        M: Send + Sync + 'static,
    {
        let (mut ctx, entries) = self.inner.prepare(
            message,
            PublishMethod::Publish,
            correlation_id,
            CancellationToken::new(),
        );

        let report = Arc::new(Mutex::new(PublishReport::default()));
        let terminal = self.inner.blocking_terminal(entries, Arc::clone(&report));
        self.inner.pipeline.run_with(&mut ctx, terminal)?;

        let report = std::mem::take(&mut *report.lock());
        Ok(report.finish(&ctx))
    }

    // --- Observing ---

    /// Counters since the bus was created. Prunes dead weak subscriptions
    /// first so `active_subscriptions` only counts live ones.
    pub fn statistics(&self) -> SignalBusStatistics {
        let mut by_type = BTreeMap::new();
        for mut bucket in self.inner.buckets.iter_mut() {
            bucket.retain(|e| e.is_alive());
            if let Some(first) = bucket.first() {
                *by_type.entry(first.message_type.to_string()).or_default() += bucket.len();
            }
        }
        self.inner.stats.snapshot(by_type)
    }

    /// The most recent captured failures, oldest first.
    pub fn recent_errors(&self) -> Vec<Arc<SignalBusErrorContext>> {
        self.inner.stats.recent_errors()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("message_types", &self.inner.buckets.len())
            .field("pipeline", &self.inner.pipeline)
            .finish()
    }
}

impl BusInner {
    /// Build the context and snapshot the live subscriptions for `M`.
    fn prepare<M>(
        &self,
        message: M,
        method: PublishMethod,
        correlation_id: Option<String>,
        cancellation: CancellationToken,
    ) -> (SignalBusContext, Vec<Arc<Entry>>)
    where
        M: Send + Sync + 'static,
    {
        let correlation_id = correlation_id.or_else(|| {
            self.config
                .generate_correlation_ids
                .then(|| Uuid::new_v4().to_string())
        });
        let entries = self.live_entries(TypeId::of::<M>());

        let mut ctx = SignalBusContext::new(Arc::new(message), method, correlation_id, cancellation);
        ctx.set_subscriber_count(entries.len());
        self.stats.record_publish(ctx.message_type());

        trace!(
            method = %method,
            message_type = ctx.message_type(),
            subscribers = entries.len(),
            "Publishing"
        );
        (ctx, entries)
    }

    /// Prune dead weak entries for a type and return the rest.
    fn live_entries(&self, type_id: TypeId) -> Vec<Arc<Entry>> {
        let Some(mut bucket) = self.buckets.get_mut(&type_id) else {
            return Vec::new();
        };

        let before = bucket.len();
        bucket.retain(|e| e.is_alive());
        let pruned = before - bucket.len();
        if pruned > 0 {
            debug!(pruned, "Pruned dead weak bus subscriptions");
        }
        bucket.clone()
    }

    pub(crate) fn contains(&self, type_id: TypeId, id: SubscriptionId) -> bool {
        self.buckets
            .get(&type_id)
            .is_some_and(|bucket| bucket.iter().any(|e| e.id == id && e.is_alive()))
    }

    /// Remove one subscription, searching every bucket when the type is
    /// unknown.
    pub(crate) fn remove(&self, type_id: Option<TypeId>, id: SubscriptionId) -> bool {
        let removed = match type_id {
            Some(type_id) => self
                .buckets
                .get_mut(&type_id)
                .is_some_and(|mut bucket| remove_entry(&mut bucket, id)),
            None => self
                .buckets
                .iter_mut()
                .any(|mut bucket| remove_entry(&mut bucket, id)),
        };

        if removed {
            debug!(subscription = %id, "Bus subscription removed");
        }
        removed
    }

    /// Innermost pipeline handler for `publish`.
    fn blocking_terminal(
        self: &Arc<Self>,
        entries: Vec<Arc<Entry>>,
        report: Arc<Mutex<PublishReport>>,
    ) -> Next {
        let inner = Arc::clone(self);
        Arc::new(move |ctx: &mut SignalBusContext| {
            if let Some(site) = begin_delivery(ctx) {
                inner.deliver_blocking(&entries, &site, &mut report.lock());
            }
            Ok(())
        })
    }

    /// Innermost pipeline handler for `publish_async`. Runs on a blocking
    /// thread and waits for async delivery on `runtime`.
    fn async_terminal(
        self: &Arc<Self>,
        entries: Vec<Arc<Entry>>,
        report: Arc<Mutex<PublishReport>>,
        runtime: Handle,
    ) -> Next {
        let inner = Arc::clone(self);
        Arc::new(move |ctx: &mut SignalBusContext| {
            if let Some(site) = begin_delivery(ctx) {
                let mut report = report.lock();
                runtime.block_on(inner.deliver_async(&entries, &site, &mut report));
            }
            Ok(())
        })
    }

    /// Deliver on the calling thread. Async handlers are handed off.
    fn deliver_blocking(
        self: &Arc<Self>,
        entries: &[Arc<Entry>],
        site: &DeliverySite,
        report: &mut PublishReport,
    ) {
        for entry in entries {
            if !entry.accepts(&*site.message) {
                report.filtered += 1;
                continue;
            }
            if entry.options.run_in_background || entry.is_async() {
                self.hand_off(entry, site, report);
                continue;
            }
            match self.invoke_blocking(entry, &site.message) {
                Ok(Invocation::Delivered) => report.delivered += 1,
                Ok(Invocation::TargetDropped) => {}
                Err(err) => {
                    self.record_failure(entry, site, err, false);
                    report.failed += 1;
                }
            }
        }
    }

    /// Deliver in priority order, awaiting each async handler.
    async fn deliver_async(
        self: &Arc<Self>,
        entries: &[Arc<Entry>],
        site: &DeliverySite,
        report: &mut PublishReport,
    ) {
        for entry in entries {
            if !entry.accepts(&*site.message) {
                report.filtered += 1;
                continue;
            }
            if entry.options.run_in_background {
                self.hand_off(entry, site, report);
                continue;
            }
            match self.invoke_async(entry, &site.message).await {
                Ok(Invocation::Delivered) => report.delivered += 1,
                Ok(Invocation::TargetDropped) => {}
                Err(err) => {
                    self.record_failure(entry, site, err, entry.is_async());
                    report.failed += 1;
                }
            }
        }
    }

    /// Run a delivery without the publisher waiting for it.
    fn hand_off(self: &Arc<Self>, entry: &Arc<Entry>, site: &DeliverySite, report: &mut PublishReport) {
        match self.spawn_detached(Arc::clone(entry), site.clone()) {
            Ok(()) => report.backgrounded += 1,
            Err(err) => {
                self.record_failure(entry, site, err, true);
                report.failed += 1;
            }
        }
    }

    fn spawn_detached(self: &Arc<Self>, entry: Arc<Entry>, site: DeliverySite) -> Result<()> {
        let inner = Arc::clone(self);
        let runtime = Handle::try_current().ok();

        match (entry.is_async(), runtime) {
            (true, Some(runtime)) => {
                runtime.spawn(async move {
                    if let Err(err) = inner.invoke_async(&entry, &site.message).await {
                        inner.record_failure(&entry, &site, err, true);
                    }
                });
            }
            (true, None) => return Err(BusError::NoRuntime(entry.message_type)),
            (false, Some(runtime)) => {
                runtime.spawn_blocking(move || {
                    if let Err(err) = inner.invoke_blocking(&entry, &site.message) {
                        inner.record_failure(&entry, &site, err, true);
                    }
                });
            }
            (false, None) => {
                std::thread::Builder::new()
                    .name("pulse-bus-background".into())
                    .spawn(move || {
                        if let Err(err) = inner.invoke_blocking(&entry, &site.message) {
                            inner.record_failure(&entry, &site, err, true);
                        }
                    })
                    .map_err(|e| BusError::Configuration(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Run a sync handler with its retry policy, sleeping the calling thread
    /// between attempts.
    fn invoke_blocking(&self, entry: &Entry, message: &Envelope) -> Result<Invocation> {
        let Handler::Sync(invoke) = &entry.handler else {
            return Err(BusError::Configuration(format!(
                "async handler for {} cannot run on a blocking path",
                entry.message_type
            )));
        };

        let mut attempt = 0;
        loop {
            let Some(result) = run_sync_once(entry, invoke, message) else {
                return Ok(Invocation::TargetDropped);
            };
            match result {
                Ok(()) => return Ok(Invocation::Delivered),
                Err(err) if attempt < entry.options.max_retries => {
                    attempt += 1;
                    log_retry(entry, attempt, &err);
                    std::thread::sleep(entry.options.retry_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run any handler with its retry policy, awaiting between attempts.
    async fn invoke_async(&self, entry: &Entry, message: &Envelope) -> Result<Invocation> {
        let mut attempt = 0;
        loop {
            let result = match &entry.handler {
                Handler::Sync(invoke) => run_sync_once(entry, invoke, message),
                Handler::Async(invoke) => run_async_once(entry, invoke, message).await,
            };
            let Some(result) = result else {
                return Ok(Invocation::TargetDropped);
            };
            match result {
                Ok(()) => return Ok(Invocation::Delivered),
                Err(err) if attempt < entry.options.max_retries => {
                    attempt += 1;
                    log_retry(entry, attempt, &err);
                    tokio::time::sleep(entry.options.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record_failure(&self, entry: &Entry, site: &DeliverySite, error: BusError, is_async: bool) {
        warn!(
            message_type = entry.message_type,
            subscription = %entry.id,
            correlation_id = site.correlation_id.as_deref(),
            error = %error,
            "Subscriber failed"
        );

        let failure = Arc::new(SignalBusErrorContext::new(
            Arc::clone(&site.message),
            entry.message_type,
            error,
            entry.id,
            site.correlation_id.clone(),
            is_async,
        ));
        self.stats.record_error(Arc::clone(&failure));

        if let Some(hook) = &self.on_error {
            hook(&failure);
        }
    }
}

/// Mark the context delivered and capture its site, unless it was cancelled.
fn begin_delivery(ctx: &mut SignalBusContext) -> Option<DeliverySite> {
    if ctx.is_cancelled() {
        trace!(message_type = ctx.message_type(), "Delivery cancelled");
        return None;
    }
    ctx.mark_dispatched();
    Some(DeliverySite::from_context(ctx))
}

fn run_sync_once(entry: &Entry, invoke: &SyncInvoke, message: &Envelope) -> Option<Result<()>> {
    let started = Instant::now();
    match catch_unwind(AssertUnwindSafe(|| invoke(&**message))) {
        Ok(None) => None,
        Ok(Some(result)) => Some(
            result
                .map_err(BusError::handler)
                .and_then(|()| check_timeout(entry, started.elapsed())),
        ),
        Err(panic) => Some(Err(BusError::Panicked(panic_message(panic.as_ref())))),
    }
}

async fn run_async_once(entry: &Entry, invoke: &AsyncInvoke, message: &Envelope) -> Option<Result<()>> {
    let future = invoke(Arc::clone(message))?;
    let guarded = AssertUnwindSafe(future).catch_unwind();

    let outcome = match entry.options.timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Some(Err(BusError::Timeout {
                    message_type: entry.message_type,
                    after: limit,
                }))
            }
        },
        None => guarded.await,
    };

    Some(match outcome {
        Ok(result) => result.map_err(BusError::handler),
        Err(panic) => Err(BusError::Panicked(panic_message(panic.as_ref()))),
    })
}

fn check_timeout(entry: &Entry, elapsed: Duration) -> Result<()> {
    match entry.options.timeout {
        Some(limit) if elapsed > limit => Err(BusError::Timeout {
            message_type: entry.message_type,
            after: limit,
        }),
        _ => Ok(()),
    }
}

fn log_retry(entry: &Entry, attempt: u32, err: &BusError) {
    debug!(
        message_type = entry.message_type,
        subscription = %entry.id,
        attempt,
        max_retries = entry.options.max_retries,
        error = %err,
        "Retrying subscriber"
    );
}

fn remove_entry(bucket: &mut Vec<Arc<Entry>>, id: SubscriptionId) -> bool {
    match bucket.iter().position(|e| e.id == id) {
        Some(pos) => {
            bucket.remove(pos);
            true
        }
        None => false,
    }
}

/// Hold `target` strongly or weakly; a weak hold also yields its liveness probe.
fn hold<S>(target: &Arc<S>, weak: bool) -> (Held<S>, Option<Weak<dyn Any + Send + Sync>>)
where
    S: Send + Sync + 'static,
{
    if weak {
        let erased: Arc<dyn Any + Send + Sync> = Arc::clone(target) as Arc<dyn Any + Send + Sync>;
        (Held::Weak(Arc::downgrade(target)), Some(Arc::downgrade(&erased)))
    } else {
        (Held::Strong(Arc::clone(target)), None)
    }
}

fn warn_unbound_weak<M>(options: &SignalBusSubscriptionOptions) {
    if options.use_weak_reference {
        warn!(
            message_type = std::any::type_name::<M>(),
            "use_weak_reference needs a target; closure handler is held strongly"
        );
    }
}

fn type_mismatch<M>() -> HandlerError {
    format!("message is not a {}", std::any::type_name::<M>()).into()
}
