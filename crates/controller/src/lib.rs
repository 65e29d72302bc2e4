//! Dark controller: GrafanaDashboard changes go through a deduplicating work
//! queue to a pool of workers, each converging one key at a time.
//!
//! Flow: cache notifications -> [`Enqueuer`] -> [`WorkQueue`] -> workers ->
//! [`Reconciler`] -> creator, status and events.

#![forbid(unsafe_code)]

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use dark_core::ResourceKey;
use dark_queue::WorkQueue;
use dark_store::HasSynced;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

pub mod handler;
pub mod reconciler;

pub use handler::Enqueuer;
pub use reconciler::{Reconciler, SyncOutcome, MESSAGE_RESOURCE_SYNCED, SUCCESS_SYNCED, WARNING_NOT_SYNCED};

pub const QUEUE_NAME: &str = "GrafanaDashboards";

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long `run` waits for the caches before giving up.
    pub cache_sync_timeout: Duration,
    /// Retries allowed for a key whose sync failed transiently.
    pub max_requeues: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { cache_sync_timeout: Duration::from_secs(60), max_requeues: 15 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to wait for caches to sync within {0:?}")]
    CacheSyncTimeout(Duration),
    #[error("stopped before caches synced")]
    StoppedBeforeSync,
    #[error("worker count must be at least 1")]
    NoWorkers,
}

pub struct Controller {
    queue: WorkQueue<ResourceKey>,
    reconciler: Reconciler,
    synced: Vec<Arc<dyn HasSynced>>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(config: ControllerConfig, reconciler: Reconciler, synced: Vec<Arc<dyn HasSynced>>) -> Self {
        Self::with_queue(config, reconciler, synced, WorkQueue::with_default_rate_limiter(QUEUE_NAME))
    }

    pub fn with_queue(
        config: ControllerConfig,
        reconciler: Reconciler,
        synced: Vec<Arc<dyn HasSynced>>,
        queue: WorkQueue<ResourceKey>,
    ) -> Self {
        Self { queue, reconciler, synced, config }
    }

    pub fn queue(&self) -> &WorkQueue<ResourceKey> { &self.queue }

    /// Handler to register on the dashboard cache.
    pub fn enqueuer(&self) -> Arc<Enqueuer> { Arc::new(Enqueuer::new(self.queue.clone())) }

    /// Wait for the caches, start `workers` workers and block until `shutdown`
    /// resolves. Then the queue stops accepting work and `run` returns once
    /// every worker finished what it holds.
    pub async fn run<S>(self: Arc<Self>, workers: usize, shutdown: S) -> Result<(), ControllerError>
    where
        S: Future<Output = ()>,
    {
        if workers == 0 {
            return Err(ControllerError::NoWorkers);
        }
        let mut shutdown = pin!(shutdown);

        info!("waiting for informer caches to sync");
        let synced = tokio::select! {
            r = wait_for_cache_sync(&self.synced, self.config.cache_sync_timeout) => r,
            _ = shutdown.as_mut() => Err(ControllerError::StoppedBeforeSync),
        };
        if let Err(e) = synced {
            self.queue.shut_down();
            return Err(e);
        }

        info!(workers, "starting controller workers");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let me = Arc::clone(&self);
                tokio::spawn(async move { me.run_worker(id).await })
            })
            .collect();
        info!("started workers");

        shutdown.await;
        info!("shutting down workers");
        self.queue.shut_down();
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("workers stopped");
        Ok(())
    }

    async fn run_worker(&self, id: usize) {
        debug!(worker = id, "worker started");
        while self.process_next_item().await {}
        debug!(worker = id, "worker stopped");
    }

    /// Take one key off the queue and sync it. Returns `false` once the queue
    /// is shut down and empty.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match AssertUnwindSafe(self.reconciler.sync(&key)).catch_unwind().await {
            Ok(SyncOutcome::TransientFailure(reason)) => self.requeue(&key, &reason),
            Ok(_) => self.queue.forget(&key),
            Err(panic) => {
                error!(key = %key, panic = %panic_message(panic.as_ref()), "recovered from panic while syncing");
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    fn requeue(&self, key: &ResourceKey, reason: &str) {
        let retries = self.queue.num_requeues(key);
        if retries < self.config.max_requeues {
            warn!(key = %key, retries, reason, "error syncing; requeuing");
            self.queue.add_rate_limited(key.clone());
        } else {
            error!(key = %key, retries, reason, "dropping key out of the queue");
            self.queue.forget(key);
        }
    }
}

/// Poll `synced` until all report ready. Errors once `timeout` elapsed.
pub async fn wait_for_cache_sync(synced: &[Arc<dyn HasSynced>], timeout: Duration) -> Result<(), ControllerError> {
    let poll = async {
        let mut tick = tokio::time::interval(CACHE_SYNC_POLL);
        loop {
            tick.tick().await;
            if synced.iter().all(|s| s.has_synced()) {
                return;
            }
        }
    };
    tokio::time::timeout(timeout, poll).await.map_err(|_| ControllerError::CacheSyncTimeout(timeout))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
