//! Integration Tests for Signals and the Bus
//!
//! These tests exercise the public surface end to end: delivery counts,
//! equality gating, async loading state, bus ordering, filtering, isolation,
//! weak lifetimes and middleware short-circuiting.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;

use pulse_core::bus::{
    ExceptionHandlingMiddleware, LoggingMiddleware, SignalBus, SignalBusSubscriptionOptions,
    ValidationMiddleware, VALIDATION_FAILED_KEY,
};
use pulse_core::signal::{AsyncTypedSignal, LoadOutcome, Signal, SubscriptionHandle, TypedSignal};
use pulse_core::BusError;

#[derive(Debug, Clone, PartialEq)]
struct OrderPlaced {
    id: u32,
    total: i64,
}

#[derive(Debug, Clone)]
enum Op {
    Subscribe,
    SubscribeWeak { keep_target: bool },
    Dispose(usize),
    DropTarget(usize),
    Notify,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Subscribe),
        2 => any::<bool>().prop_map(|keep_target| Op::SubscribeWeak { keep_target }),
        2 => any::<usize>().prop_map(Op::Dispose),
        1 => any::<usize>().prop_map(Op::DropTarget),
        3 => Just(Op::Notify),
    ]
}

proptest! {
    /// Deliveries per notify equal live registrations at the start of it.
    #[test]
    fn notify_delivers_to_every_live_subscription(ops in prop::collection::vec(op(), 1..60)) {
        let signal = Signal::new();
        // Each registration with the receiver it watches, if weak.
        let mut registrations: Vec<(SubscriptionHandle, Option<std::sync::Weak<()>>)> = Vec::new();
        let mut targets: Vec<Arc<()>> = Vec::new();

        for op in ops {
            match op {
                Op::Subscribe => {
                    registrations.push((signal.subscribe(|| {}), None));
                }
                Op::SubscribeWeak { keep_target } => {
                    let target = Arc::new(());
                    let handle = signal.subscribe_weak(&target, |_| {});
                    registrations.push((handle, Some(Arc::downgrade(&target))));
                    if keep_target {
                        targets.push(target);
                    }
                }
                Op::Dispose(i) if !registrations.is_empty() => {
                    // May already be pruned if its target is gone.
                    let (handle, _) = registrations.remove(i % registrations.len());
                    let _ = handle.dispose();
                }
                Op::DropTarget(i) if !targets.is_empty() => {
                    targets.remove(i % targets.len());
                }
                Op::Notify => {
                    let live = registrations
                        .iter()
                        .filter(|(_, target)| target.as_ref().map_or(true, |t| t.strong_count() > 0))
                        .count();
                    prop_assert_eq!(signal.notify(), live);
                }
                _ => {}
            }
        }
    }

    /// A typed signal notifies exactly when the assigned value differs.
    #[test]
    fn typed_signal_notifies_only_on_change(values in prop::collection::vec(0i32..4, 0..40)) {
        let signal = TypedSignal::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _handle = signal.subscribe_value(move |v| seen_clone.lock().push(*v));

        let mut expected = Vec::new();
        let mut current = 0;
        for value in values {
            let changed = signal.set(value);
            prop_assert_eq!(changed, value != current);
            if changed {
                expected.push(value);
                current = value;
            }
        }
        prop_assert_eq!(&*seen.lock(), &expected);
    }
}

#[test]
fn disposed_handles_stop_delivery_exactly() {
    let signal = Signal::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let hits = hits.clone();
            signal.subscribe(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    assert_eq!(signal.notify(), 4);
    let mut handles = handles.into_iter();
    if let Some(first) = handles.next() {
        assert!(first.dispose());
    }
    drop(handles.next());

    assert_eq!(signal.notify(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 6);
}

#[test]
fn subscription_added_during_notify_waits_for_next_round() {
    let signal = Signal::new();
    let late = Arc::new(AtomicI32::new(0));
    let pending = Arc::new(Mutex::new(Vec::new()));

    let signal_clone = signal.clone();
    let late_clone = late.clone();
    let pending_clone = pending.clone();
    let _first = signal.subscribe(move || {
        let late = late_clone.clone();
        let handle = signal_clone.subscribe(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        pending_clone.lock().push(handle);
    });

    assert_eq!(signal.notify(), 1);
    assert_eq!(late.load(Ordering::SeqCst), 0);

    assert_eq!(signal.notify(), 2);
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn async_typed_signal_load_outcomes() {
    let orders = AsyncTypedSignal::new(Vec::<u32>::new());
    let changes = Arc::new(AtomicUsize::new(0));
    let changes_clone = changes.clone();
    let _watch = orders.subscribe_value(move |_| {
        changes_clone.fetch_add(1, Ordering::SeqCst);
    });

    let outcome = orders
        .load(|_| async { Ok::<_, std::io::Error>(vec![1, 2, 3]) })
        .await;
    assert_eq!(outcome, LoadOutcome::Completed);
    assert!(!orders.is_loading());
    assert!(orders.error().is_none());
    assert_eq!(orders.get(), vec![1, 2, 3]);
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    let outcome = orders
        .load(|_| async { Err::<Vec<u32>, _>(std::io::Error::other("offline")) })
        .await;
    assert_eq!(outcome, LoadOutcome::Failed);
    assert!(!orders.is_loading());
    assert_eq!(
        orders.error().map(|e| e.to_string()),
        Some("offline".to_string())
    );
    assert_eq!(orders.get(), vec![1, 2, 3]);
}

#[tokio::test]
async fn async_typed_signal_observes_loading_transitions() {
    let value = AsyncTypedSignal::new(0);
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let transitions_clone = transitions.clone();
    let _watch = value
        .is_loading_signal()
        .subscribe_value(move |loading| transitions_clone.lock().push(*loading));

    value.load(|_| async { Ok::<_, std::io::Error>(5) }).await;
    assert_eq!(*transitions.lock(), vec![true, false]);
}

#[test]
fn bus_priority_ties_keep_registration_order() {
    let bus = SignalBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (name, priority) in [("b", 5), ("a", 10), ("c", 5)] {
        let order = order.clone();
        bus.subscribe_with(
            move |_: &OrderPlaced| {
                order.lock().push(name);
                Ok(())
            },
            SignalBusSubscriptionOptions::new().with_priority(priority),
        );
    }

    bus.publish(OrderPlaced { id: 1, total: 10 }).unwrap();
    assert_eq!(*order.lock(), vec!["a", "b", "c"]);
}

#[test]
fn bus_rejecting_filter_never_delivers() {
    let bus = SignalBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    bus.subscribe_with(
        move |_: &OrderPlaced| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        SignalBusSubscriptionOptions::new().with_filter(|_: &OrderPlaced| false),
    );

    for id in 0..5 {
        let report = bus.publish(OrderPlaced { id, total: 1 }).unwrap();
        assert_eq!(report.filtered, 1);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(bus.statistics().active_subscriptions, 1);
}

#[test]
fn bus_isolates_failing_subscriber() {
    let bus = SignalBus::new();
    let invoked = Arc::new(AtomicUsize::new(0));

    let a = invoked.clone();
    bus.subscribe_with(
        move |_: &OrderPlaced| {
            a.fetch_add(1, Ordering::SeqCst);
            Err("declined".into())
        },
        SignalBusSubscriptionOptions::new().with_priority(1),
    );
    let b = invoked.clone();
    bus.subscribe(move |_: &OrderPlaced| {
        b.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let before = bus.statistics().total_errors;
    bus.publish(OrderPlaced { id: 1, total: 1 }).unwrap();

    assert_eq!(invoked.load(Ordering::SeqCst), 2);
    assert_eq!(bus.statistics().total_errors, before + 1);
    let failure = &bus.recent_errors()[0];
    assert_eq!(failure.message::<OrderPlaced>().map(|o| o.id), Some(1));
}

#[test]
fn bus_weak_subscription_dies_with_target() {
    struct Audit {
        seen: AtomicUsize,
    }

    let bus = SignalBus::new();
    let audit = Arc::new(Audit {
        seen: AtomicUsize::new(0),
    });
    bus.subscribe_weak(
        &audit,
        |audit: &Audit, _: &OrderPlaced| {
            audit.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        SignalBusSubscriptionOptions::new().weak(),
    );

    bus.publish(OrderPlaced { id: 1, total: 1 }).unwrap();
    assert_eq!(audit.seen.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscriber_count::<OrderPlaced>(), 1);

    drop(audit);
    let report = bus.publish(OrderPlaced { id: 2, total: 1 }).unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(bus.subscriber_count::<OrderPlaced>(), 0);
}

#[test]
fn validation_short_circuit_cancels_context() {
    let observed = Arc::new(Mutex::new(None));
    let observed_clone = observed.clone();
    let bus = SignalBus::builder()
        .middleware(|m| {
            m.use_default::<LoggingMiddleware>()
                .use_fn(move |ctx, next| {
                    let result = next(ctx);
                    *observed_clone.lock() =
                        Some((ctx.is_cancelled(), ctx.item(VALIDATION_FAILED_KEY).cloned()));
                    result
                })
                .use_middleware(ValidationMiddleware::new().rule(|o: &OrderPlaced| o.total > 0))
        })
        .build();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    bus.subscribe(move |_: &OrderPlaced| {
        hits_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let report = bus.publish(OrderPlaced { id: 1, total: -5 }).unwrap();
    assert!(report.cancelled);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let (cancelled, flag) = observed.lock().take().unwrap();
    assert!(cancelled);
    assert_eq!(flag, Some(serde_json::Value::Bool(true)));
}

#[test]
fn exception_middleware_swallows_middleware_failures() {
    let bus = SignalBus::builder()
        .middleware(|m| {
            m.use_default::<ExceptionHandlingMiddleware>()
                .use_fn(|_, _| Err(BusError::middleware("audit store down")))
        })
        .build();
    bus.subscribe(|_: &OrderPlaced| Ok(()));

    let report = bus.publish(OrderPlaced { id: 1, total: 1 }).unwrap();
    assert!(report.cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_publish_inside_runtime_backgrounds_async_handlers() {
    let bus = SignalBus::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.subscribe_async(move |order: Arc<OrderPlaced>| {
        let tx = tx.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(order.id);
            Ok(())
        }
    });

    let report = bus.publish(OrderPlaced { id: 42, total: 1 }).unwrap();
    assert_eq!(report.backgrounded, 1);
    assert_eq!(rx.recv().await, Some(42));
}
