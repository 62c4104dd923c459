//! Global rate limiter.
//!
//! One process-wide queue for every outgoing platform call. A single
//! dispatcher task pops entries in submission order, waits for bucket
//! capacity, and runs them. Entries sharing a dedup key collapse while
//! queued: the newest function wins and every submitter gets its result.
//!
//! A throttle error pauses the whole dispatcher and puts the entry back at
//! the front of the queue.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use courier_core::metrics::{
    DISPATCH_COMPACTED_TOTAL, DISPATCH_EXECUTED_TOTAL, DISPATCH_FAILED_TOTAL,
    DISPATCH_QUEUE_DEPTH, DISPATCH_SUBMITTED_TOTAL, DISPATCH_THROTTLED_TOTAL,
};
use courier_settings::MessagingSettings;
use futures::future::BoxFuture;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bucket::LeakyBucket;
use crate::errors::{DispatchError, Result};

type Value = Arc<dyn Any + Send + Sync>;
type Outcome = Result<Value>;
type DispatchFn = Arc<dyn Fn() -> BoxFuture<'static, Outcome> + Send + Sync>;
type Waiter = oneshot::Sender<Outcome>;

/// Limiter tuning.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimiterConfig {
    /// Dispatches admitted per window.
    pub rate_limit: u32,
    /// Rolling window length.
    pub rate_window: Duration,
    /// Pause for throttle messages that name no wait.
    pub default_flood_wait: Duration,
}

/// Longest flood pause honoured.
pub const MAX_FLOOD_PAUSE: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_limit: 1,
            rate_window: Duration::from_secs(2),
            default_flood_wait: Duration::from_secs(30),
        }
    }
}

impl From<&MessagingSettings> for LimiterConfig {
    fn from(settings: &MessagingSettings) -> Self {
        Self {
            rate_limit: settings.rate_limit,
            rate_window: settings.rate_window(),
            default_flood_wait: settings.default_flood_wait(),
        }
    }
}

struct Entry {
    func: DispatchFn,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    entries: HashMap<String, Entry>,
    paused_until: Option<Instant>,
    stopped: bool,
}

impl QueueState {
    fn publish_depth(&self) {
        gauge!(DISPATCH_QUEUE_DEPTH).set(self.order.len() as f64);
    }
}

struct Shared {
    queue: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
}

/// Handle to the process-wide dispatch queue.
///
/// Construct one with [`start`](Self::start) at process start and clone it
/// into every consumer. Call [`shutdown`](Self::shutdown) to stop it.
#[derive(Clone)]
pub struct GlobalRateLimiter {
    shared: Arc<Shared>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl GlobalRateLimiter {
    /// Spawn the dispatcher. Must be called inside a Tokio runtime.
    pub fn start(config: LimiterConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        });
        let handle = tokio::spawn(run_dispatcher(Arc::clone(&shared), config));
        info!(
            rate_limit = config.rate_limit,
            window_secs = config.rate_window.as_secs_f64(),
            "rate limiter started"
        );
        Self {
            shared,
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Submit `func` and wait for the result of whichever version of its
    /// entry actually runs.
    ///
    /// With a `dedup_key` that is already queued, `func` replaces the queued
    /// function in place and this call shares its outcome. Without a key the
    /// submission is unique.
    pub async fn enqueue<T, F, Fut>(&self, func: F, dedup_key: Option<&str>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(erase(func), dedup_key, Some(tx))?;
        let value = rx.await.map_err(|_| DispatchError::Dropped)??;
        value
            .downcast::<T>()
            .map(Arc::unwrap_or_clone)
            .map_err(|_| DispatchError::TypeMismatch)
    }

    /// Submit `func` without waiting. Dispatch failures are only logged;
    /// the error is a rejected submission ([`DispatchError::Stopped`]).
    pub fn fire_and_forget<T, F, Fut>(&self, func: F, dedup_key: Option<&str>) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(erase(func), dedup_key, None)
    }

    /// Entries waiting to run.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().order.len()
    }

    /// Remaining flood pause, if any.
    pub fn paused_for(&self) -> Option<Duration> {
        let until = self.shared.queue.lock().paused_until?;
        let remaining = until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Stop the dispatcher and fail every queued waiter with
    /// [`DispatchError::Stopped`]. Later submissions are rejected.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let dropped = fail_all(&self.shared);
        info!(dropped, "rate limiter stopped");
    }

    fn submit(&self, func: DispatchFn, dedup_key: Option<&str>, waiter: Option<Waiter>) -> Result<()> {
        let key = dedup_key.map_or_else(|| format!("task:{}", Uuid::now_v7()), str::to_string);

        let mut guard = self.shared.queue.lock();
        if guard.stopped {
            return Err(DispatchError::Stopped);
        }
        counter!(DISPATCH_SUBMITTED_TOTAL).increment(1);

        let state = &mut *guard;
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.func = func;
            entry.waiters.extend(waiter);
            counter!(DISPATCH_COMPACTED_TOTAL).increment(1);
            debug!(dedup_key = %key, waiters = entry.waiters.len(), "compacted queued entry");
            return Ok(());
        }

        let waiters = waiter.into_iter().collect();
        let _ = state.entries.insert(key.clone(), Entry { func, waiters });
        state.order.push_back(key);
        state.publish_depth();
        drop(guard);
        self.shared.notify.notify_one();
        Ok(())
    }
}

impl std::fmt::Debug for GlobalRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalRateLimiter")
            .field("queued", &self.queue_len())
            .finish_non_exhaustive()
    }
}

fn erase<T, F, Fut>(func: F) -> DispatchFn
where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move || {
        let fut = func();
        Box::pin(async move { fut.await.map(|v| Arc::new(v) as Value) })
    })
}

// ── Dispatcher ──────────────────────────────────────────────────────────

async fn run_dispatcher(shared: Arc<Shared>, config: LimiterConfig) {
    let mut bucket = LeakyBucket::new(config.rate_limit, config.rate_window);
    debug!("dispatcher started");

    while let Some((key, entry)) = next_entry(&shared).await {
        let pause = shared.queue.lock().paused_until;
        if let Some(until) = pause.filter(|u| *u > Instant::now()) {
            warn!(
                remaining_secs = (until - Instant::now()).as_secs_f64(),
                "dispatcher paused"
            );
            if !sleep_or_cancel(&shared, until).await {
                requeue_front(&shared, key, entry);
                break;
            }
        }

        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => {
                requeue_front(&shared, key, entry);
                break;
            }
            () = bucket.acquire() => {}
        }

        let func = Arc::clone(&entry.func);
        let mut call = tokio::spawn(async move { func().await });
        let outcome = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => {
                call.abort();
                requeue_front(&shared, key, entry);
                break;
            }
            joined = &mut call => match joined {
                Ok(Err(DispatchError::Failed(message))) => {
                    Err(DispatchError::from_message(&message, config.default_flood_wait))
                }
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    error!(dedup_key = %key, "dispatched function panicked");
                    Err(DispatchError::failed("dispatched function panicked"))
                }
                Err(e) => Err(DispatchError::failed(e.to_string())),
            },
        };

        match outcome {
            Ok(value) => {
                counter!(DISPATCH_EXECUTED_TOTAL).increment(1);
                debug!(dedup_key = %key, waiters = entry.waiters.len(), "dispatched");
                for waiter in entry.waiters {
                    let _ = waiter.send(Ok(Arc::clone(&value)));
                }
            }
            Err(DispatchError::Throttled { retry_after }) => {
                counter!(DISPATCH_THROTTLED_TOTAL).increment(1);
                let until = extend_pause(&shared, retry_after);
                warn!(
                    dedup_key = %key,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "throttled, pausing and retrying at front"
                );
                requeue_front(&shared, key, entry);
                if !sleep_or_cancel(&shared, until).await {
                    break;
                }
            }
            Err(e) => {
                counter!(DISPATCH_FAILED_TOTAL).increment(1);
                if entry.waiters.is_empty() {
                    warn!(dedup_key = %key, error = %e, "fire-and-forget dispatch failed");
                } else {
                    debug!(dedup_key = %key, error = %e, "dispatch failed");
                }
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    debug!("dispatcher stopped");
}

/// Pop the head entry, waiting for one if the queue is empty. `None` once
/// cancelled.
async fn next_entry(shared: &Shared) -> Option<(String, Entry)> {
    loop {
        if shared.cancel.is_cancelled() {
            return None;
        }
        {
            let mut state = shared.queue.lock();
            while let Some(key) = state.order.pop_front() {
                if let Some(entry) = state.entries.remove(&key) {
                    state.publish_depth();
                    return Some((key, entry));
                }
            }
        }
        tokio::select! {
            () = shared.notify.notified() => {}
            () = shared.cancel.cancelled() => return None,
        }
    }
}

/// Record a pause of `retry_after` from now, keeping any later deadline.
/// Waits beyond [`MAX_FLOOD_PAUSE`] are capped.
fn extend_pause(shared: &Shared, retry_after: Duration) -> Instant {
    let now = Instant::now();
    let requested = now
        .checked_add(retry_after.min(MAX_FLOOD_PAUSE))
        .unwrap_or(now);
    let mut state = shared.queue.lock();
    let until = state.paused_until.map_or(requested, |current| current.max(requested));
    state.paused_until = Some(until);
    until
}

/// Put an entry back at the head of the queue.
///
/// If a submission with the same key arrived while the entry was out, the
/// two merge: the newer function is kept and the original waiters come
/// first.
fn requeue_front(shared: &Shared, key: String, entry: Entry) {
    let mut guard = shared.queue.lock();
    let state = &mut *guard;
    if state.stopped {
        for waiter in entry.waiters {
            let _ = waiter.send(Err(DispatchError::Stopped));
        }
        return;
    }

    let merged = match state.entries.remove(&key) {
        Some(newer) => {
            state.order.retain(|k| *k != key);
            let mut waiters = entry.waiters;
            waiters.extend(newer.waiters);
            Entry {
                func: newer.func,
                waiters,
            }
        }
        None => entry,
    };
    let _ = state.entries.insert(key.clone(), merged);
    state.order.push_front(key);
    state.publish_depth();
}

/// Sleep until `until`; false if cancelled first.
async fn sleep_or_cancel(shared: &Shared, until: Instant) -> bool {
    tokio::select! {
        biased;
        () = shared.cancel.cancelled() => false,
        () = tokio::time::sleep_until(until) => true,
    }
}

/// Mark stopped and fail everything still queued. Returns entries dropped.
fn fail_all(shared: &Shared) -> usize {
    let mut state = shared.queue.lock();
    state.stopped = true;
    state.order.clear();
    let entries: Vec<Entry> = state.entries.drain().map(|(_, e)| e).collect();
    state.publish_depth();
    drop(state);

    let count = entries.len();
    for entry in entries {
        for waiter in entry.waiters {
            let _ = waiter.send(Err(DispatchError::Stopped));
        }
    }
    count
}
