//! Dark work queue: a rate-limited, deduplicating queue of work items.
//!
//! Guarantees:
//! - an item queued several times is handed out once;
//! - an item is never handed to two workers at the same time;
//! - an item re-added while a worker holds it is redelivered once, after
//!   [`WorkQueue::done`].

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Notify};
use tracing::debug;

pub mod rate_limit;

pub use rate_limit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};

struct State<T> {
    queue: VecDeque<T>,
    /// Items waiting to be processed, queued or deferred behind an in-flight copy.
    dirty: FxHashSet<T>,
    /// Items currently held by a worker.
    processing: FxHashSet<T>,
    queued_at: FxHashMap<T, Instant>,
    started_at: FxHashMap<T, Instant>,
    shutting_down: bool,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    available: Notify,
    drained: Notify,
    shutdown: watch::Sender<bool>,
    limiter: Box<dyn RateLimiter<T>>,
}

/// Cheap to clone; all clones share the same queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    queued_at: FxHashMap::default(),
                    started_at: FxHashMap::default(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                drained: Notify::new(),
                shutdown,
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Queue using [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str { &self.shared.name }

    /// Number of items waiting to be handed out (excludes in-flight ones).
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Mark `item` as needing processing. Ignored after shutdown.
    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "name" => self.shared.name.clone());
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            // redelivered by done()
            return;
        }
        st.queued_at.insert(item.clone(), Instant::now());
        st.queue.push_back(item);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name.clone());
        drop(st);
        self.shared.available.notify_one();
    }

    /// Wait for the next item. `None` once the queue is shut down and empty.
    ///
    /// The caller owns the returned item until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.shared.available.notified());
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(item) = st.queue.pop_front() {
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name.clone());
                    if let Some(t0) = st.queued_at.remove(&item) {
                        histogram!(
                            "workqueue_queue_duration_ms",
                            t0.elapsed().as_secs_f64() * 1000.0,
                            "name" => self.shared.name.clone()
                        );
                    }
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    st.started_at.insert(item.clone(), Instant::now());
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `item` after processing; requeues it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        if !st.processing.remove(item) {
            return;
        }
        if let Some(t0) = st.started_at.remove(item) {
            histogram!(
                "workqueue_work_duration_ms",
                t0.elapsed().as_secs_f64() * 1000.0,
                "name" => self.shared.name.clone()
            );
        }
        let redeliver = st.dirty.contains(item);
        if redeliver {
            st.queued_at.insert(item.clone(), Instant::now());
            st.queue.push_back(item.clone());
            gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name.clone());
        }
        let idle = st.processing.is_empty();
        drop(st);
        if redeliver {
            self.shared.available.notify_one();
        }
        if idle {
            self.shared.drained.notify_waiters();
        }
    }

    /// Add `item` once `delay` has passed. Needs a running tokio runtime when
    /// `delay` is non-zero. Pending delayed adds are dropped on shutdown.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        let shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = wait_closed(shutdown) => {}
            }
        });
    }

    /// Add `item` after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "name" => self.shared.name.clone());
        debug!(queue = %self.shared.name, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(item, delay);
    }

    /// Reset the failure history of `item`.
    pub fn forget(&self, item: &T) { self.shared.limiter.forget(item); }

    pub fn num_requeues(&self, item: &T) -> u32 { self.shared.limiter.num_requeues(item) }

    /// Stop accepting items and wake every idle `get`. Items already queued
    /// are still handed out; in-flight items finish normally.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        st.shutting_down = true;
        drop(st);
        self.shared.shutdown.send_replace(true);
        self.shared.available.notify_waiters();
    }

    /// [`WorkQueue::shut_down`], then wait until no item is in flight.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let mut drained = pin!(self.shared.drained.notified());
            drained.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
