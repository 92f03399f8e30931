//! Async Signals
//!
//! Composite signals that wrap a unit of async work with an `is_loading`
//! flag and an `error` slot, each an independently observable signal.
//!
//! # Load Lifecycle
//!
//! ```text
//! Idle -> Loading -> (Success | Failure | Cancelled) -> Idle
//! ```
//!
//! - Entry clears `error` and sets `is_loading`.
//! - Success commits the value (typed variant) or notifies (untyped).
//! - Failure stores the error and leaves the value alone.
//! - Cancellation changes nothing.
//! - Exit always clears `is_loading`, even if the load future is dropped.
//!
//! Concurrent loads are not serialized; the last one to finish wins.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::registry::SubscriptionHandle;
use super::signal::{Signal, TypedSignal};
use super::Observable;
use crate::error::LoadError;

/// How a load or run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The work finished and its result was committed.
    Completed,

    /// The work failed; the error is in the `error` signal.
    Failed,

    /// The work was cancelled; state is as it was before the call.
    Cancelled,
}

/// Resets the loading flag on every exit path.
struct LoadingGuard<'a>(&'a TypedSignal<bool>);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Loading and error signals shared by both async signal kinds.
#[derive(Clone)]
struct LoadState {
    is_loading: TypedSignal<bool>,
    error: TypedSignal<Option<LoadError>>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl LoadState {
    fn new() -> Self {
        Self {
            is_loading: TypedSignal::new(false),
            error: TypedSignal::new(None),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Run `work` through the load lifecycle and hand a success to `commit`.
    async fn drive<R, E, F, Fut>(&self, work: F, commit: impl FnOnce(R)) -> LoadOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let token = self.cancel.lock().child_token();

        self.error.set(None);
        self.is_loading.set(true);
        let _loading = LoadingGuard(&self.is_loading);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = work(token.clone()) => Some(result),
        };

        match result {
            Some(Ok(value)) => {
                commit(value);
                LoadOutcome::Completed
            }
            Some(Err(err)) => {
                let err = LoadError::new(err);
                debug!(error = %err, "Load failed");
                self.error.set(Some(err));
                LoadOutcome::Failed
            }
            None => {
                trace!("Load cancelled");
                LoadOutcome::Cancelled
            }
        }
    }

    /// Cancel every load in flight. Later loads are unaffected.
    fn cancel(&self) {
        let mut current = self.cancel.lock();
        current.cancel();
        *current = CancellationToken::new();
    }
}

/// An async unit of work exposed as signals.
///
/// The inner [`Signal`] notifies after each successful run.
#[derive(Clone)]
pub struct AsyncSignal {
    signal: Signal,
    state: LoadState,
}

impl AsyncSignal {
    /// Create an idle async signal.
    pub fn new() -> Self {
        Self {
            signal: Signal::new(),
            state: LoadState::new(),
        }
    }

    /// Run `work`, tracking loading and error state.
    ///
    /// Never returns the work's error; it lands in [`AsyncSignal::error`].
    pub async fn run<F, Fut, E>(&self, work: F) -> LoadOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.state
            .drive(work, |()| {
                self.signal.notify();
            })
            .await
    }

    /// Cancel every run in flight.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Register an action run after each successful run.
    pub fn subscribe<F>(&self, action: F) -> SubscriptionHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.signal.subscribe(action)
    }

    /// The completion signal.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// The loading flag signal.
    pub fn is_loading_signal(&self) -> &TypedSignal<bool> {
        &self.state.is_loading
    }

    /// The last-error signal.
    pub fn error_signal(&self) -> &TypedSignal<Option<LoadError>> {
        &self.state.error
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading.get()
    }

    pub fn error(&self) -> Option<LoadError> {
        self.state.error.get()
    }

    /// The constituent signals: completion, loading, error.
    pub fn internal_signals(&self) -> Vec<Arc<dyn Observable>> {
        vec![
            Arc::new(self.signal.clone()),
            Arc::new(self.state.is_loading.clone()),
            Arc::new(self.state.error.clone()),
        ]
    }

    /// Clear subscriptions on all constituent signals.
    pub fn dispose(&self) {
        self.signal.dispose();
        self.state.is_loading.dispose();
        self.state.error.dispose();
    }
}

impl Default for AsyncSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// An async-loaded value exposed as signals.
///
/// # Example
///
/// ```rust
/// use pulse_core::signal::{AsyncTypedSignal, LoadOutcome};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let user = AsyncTypedSignal::new(String::new());
/// let outcome = user
///     .load(|_cancel| async { Ok::<_, std::io::Error>("ada".to_string()) })
///     .await;
///
/// assert_eq!(outcome, LoadOutcome::Completed);
/// assert_eq!(user.get(), "ada");
/// assert!(!user.is_loading());
/// # }
/// ```
pub struct AsyncTypedSignal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    value: TypedSignal<T>,
    state: LoadState,
}

impl<T> AsyncTypedSignal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an idle async signal holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            value: TypedSignal::new(initial),
            state: LoadState::new(),
        }
    }

    /// Load a new value.
    ///
    /// On success the value is set, notifying if it changed. On failure the
    /// previous value is kept and the error is stored.
    pub async fn load<F, Fut, E>(&self, loader: F) -> LoadOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.state
            .drive(loader, |value| {
                self.value.set(value);
            })
            .await
    }

    /// Cancel every load in flight.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Get a clone of the current value.
    pub fn get(&self) -> T {
        self.value.get()
    }

    /// Register an action receiving each committed value.
    pub fn subscribe_value<F>(&self, action: F) -> SubscriptionHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.value.subscribe_value(action)
    }

    /// The value signal.
    pub fn value(&self) -> &TypedSignal<T> {
        &self.value
    }

    pub fn is_loading_signal(&self) -> &TypedSignal<bool> {
        &self.state.is_loading
    }

    pub fn error_signal(&self) -> &TypedSignal<Option<LoadError>> {
        &self.state.error
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading.get()
    }

    pub fn error(&self) -> Option<LoadError> {
        self.state.error.get()
    }

    /// The constituent signals: value, loading, error.
    pub fn internal_signals(&self) -> Vec<Arc<dyn Observable>> {
        vec![
            Arc::new(self.value.clone()),
            Arc::new(self.state.is_loading.clone()),
            Arc::new(self.state.error.clone()),
        ]
    }

    /// Clear subscriptions on all constituent signals.
    pub fn dispose(&self) {
        self.value.dispose();
        self.state.is_loading.dispose();
        self.state.error.dispose();
    }
}

impl<T> Clone for AsyncTypedSignal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            state: self.state.clone(),
        }
    }
}
