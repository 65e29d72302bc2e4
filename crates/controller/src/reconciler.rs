//! Per-key sync logic: look the dashboard up again, push it to the creator,
//! report the outcome.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use dark_core::{
    Dashboard, DashboardCreator, DashboardStatus, EventRecorder, EventType, KeyKind, ObjectRef, ResourceKey,
    StatusReporter,
};
use dark_store::DashboardLister;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, warn};

/// Event reason for a successful sync.
pub const SUCCESS_SYNCED: &str = "Synced";
/// Event reason for a failed or impossible sync.
pub const WARNING_NOT_SYNCED: &str = "Not synced";
pub const MESSAGE_RESOURCE_SYNCED: &str = "GrafanaDashboard synced successfully";

/// How one attempt ended; decides what the queue does with the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    /// Reported through status and events; not retried.
    Failed(String),
    /// Retried with backoff.
    TransientFailure(String),
    /// The resource left the cache after being queued.
    Gone,
    /// The key could not be decoded.
    Invalid(String),
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Success => "ok",
            SyncOutcome::Failed(_) => "error",
            SyncOutcome::TransientFailure(_) => "retry",
            SyncOutcome::Gone => "gone",
            SyncOutcome::Invalid(_) => "invalid",
        }
    }
}

/// One async lock per dashboard uid. Reconcile and deletion keys of the same
/// dashboard are distinct queue items, so the queue alone does not keep the
/// creator from seeing both at once.
#[derive(Default)]
pub(crate) struct UidLocks {
    locks: Mutex<FxHashMap<String, Arc<AsyncMutex<()>>>>,
}

pub(crate) struct UidGuard<'a> {
    owner: &'a UidLocks,
    uid: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UidLocks {
    pub(crate) async fn lock(&self, uid: &str) -> UidGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(uid.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        UidGuard { owner: self, uid: uid.to_string(), guard: Some(guard) }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize { self.locks.lock().unwrap_or_else(PoisonError::into_inner).len() }
}

impl Drop for UidGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.owner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // only the map still holds it: nobody waits, prune
        if locks.get(&self.uid).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.uid);
        }
    }
}

pub struct Reconciler {
    lister: Arc<dyn DashboardLister>,
    creator: Arc<dyn DashboardCreator>,
    status: Arc<dyn StatusReporter>,
    events: Arc<dyn EventRecorder>,
    requeue_on_creator_failure: bool,
    in_flight: UidLocks,
}

impl Reconciler {
    pub fn new(
        lister: Arc<dyn DashboardLister>,
        creator: Arc<dyn DashboardCreator>,
        status: Arc<dyn StatusReporter>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self { lister, creator, status, events, requeue_on_creator_failure: false, in_flight: UidLocks::default() }
    }

    /// Turn creator failures into retries instead of terminal outcomes.
    pub fn requeue_on_creator_failure(mut self, on: bool) -> Self {
        self.requeue_on_creator_failure = on;
        self
    }

    pub async fn sync(&self, key: &ResourceKey) -> SyncOutcome {
        let outcome = match key.classify() {
            KeyKind::Invalid { reason } => {
                error!(key = %key, reason = %reason, "invalid resource key");
                SyncOutcome::Invalid(reason)
            }
            KeyKind::Deletion { uid } => self.sync_deletion(&uid).await,
            KeyKind::Reconcile { namespace, name } => self.sync_dashboard(key, &namespace, &name).await,
        };
        counter!("dashboard_sync_total", 1u64, "result" => outcome.label());
        outcome
    }

    /// Deletions are fire and forget: the resource is gone, nothing is left
    /// to converge to.
    async fn sync_deletion(&self, uid: &str) -> SyncOutcome {
        let result = {
            let _held = self.in_flight.lock(uid).await;
            self.creator.delete(uid).await
        };
        match result {
            Ok(()) => {
                counter!("dashboard_delete_total", 1u64, "result" => "ok");
                info!(uid, "successfully deleted dashboard");
            }
            Err(e) => {
                counter!("dashboard_delete_total", 1u64, "result" => "error");
                let message = format!("{:#}", e);
                error!(uid, error = %message, "dashboard in work queue could not be deleted");
            }
        }
        SyncOutcome::Success
    }

    async fn sync_dashboard(&self, key: &ResourceKey, namespace: &str, name: &str) -> SyncOutcome {
        let Some(dashboard) = self.lister.get(namespace, name) else {
            let message = format!("dashboard '{}' in work queue no longer exists", key);
            warn!(key = %key, "{}", message);
            let object = ObjectRef::new(Some(namespace), name);
            self.events.record_event(&object, EventType::Warning, WARNING_NOT_SYNCED, &message).await;
            return SyncOutcome::Gone;
        };

        let started = Instant::now();
        let result = {
            let _held = self.in_flight.lock(dashboard.name()).await;
            self.creator.from_raw_spec(&dashboard.folder, dashboard.name(), &dashboard.raw_spec).await
        };
        histogram!("dashboard_sync_ms", started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(()) => {
                self.events
                    .record_event(&dashboard.meta, EventType::Normal, SUCCESS_SYNCED, MESSAGE_RESOURCE_SYNCED)
                    .await;
                self.update_status(&dashboard, DashboardStatus::synchronized()).await;
                info!(key = %key, "successfully synced dashboard");
                SyncOutcome::Success
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(key = %key, error = %message, "could not create dashboard from spec");
                self.events
                    .record_event(
                        &dashboard.meta,
                        EventType::Warning,
                        WARNING_NOT_SYNCED,
                        &format!("could not create dashboard from spec: {}", message),
                    )
                    .await;
                self.update_status(&dashboard, DashboardStatus::failed(message.clone())).await;
                if self.requeue_on_creator_failure {
                    SyncOutcome::TransientFailure(message)
                } else {
                    SyncOutcome::Failed(message)
                }
            }
        }
    }

    /// Status goes out on a private copy; the cached object stays untouched.
    async fn update_status(&self, dashboard: &Dashboard, status: DashboardStatus) {
        let copy = dashboard.with_status(status);
        if let Err(e) = self.status.update_status(&copy).await {
            counter!("dashboard_status_update_failed_total", 1u64);
            warn!(
                namespace = copy.namespace().unwrap_or(""),
                name = copy.name(),
                error = %e,
                "error while updating dashboard status"
            );
        }
    }
}
