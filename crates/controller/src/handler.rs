//! Cache notifications turned into work queue keys.

use dark_core::{Dashboard, Notification, NotificationHandler, ResourceKey};
use dark_queue::WorkQueue;
use tracing::{debug, error};

/// Enqueues a key for every meaningful dashboard change. Safe to call from
/// any task; the queue does the deduplication.
#[derive(Clone)]
pub struct Enqueuer {
    queue: WorkQueue<ResourceKey>,
}

impl Enqueuer {
    pub fn new(queue: WorkQueue<ResourceKey>) -> Self { Self { queue } }

    pub fn on_add(&self, dashboard: &Dashboard) {
        match dashboard.reconcile_key() {
            Ok(key) => self.queue.add(key),
            Err(e) => error!(object = %dashboard.meta, error = %e, "cannot build reconcile key"),
        }
    }

    /// Periodic resyncs replay objects unchanged; two versions of the same
    /// object always differ in resource version, so equal versions are skipped.
    pub fn on_update(&self, old: &Dashboard, new: &Dashboard) {
        if old.resource_version() == new.resource_version() {
            debug!(object = %new.meta, "resource version unchanged; skipping");
            return;
        }
        self.on_add(new);
    }

    /// The object is already gone from the cache; only its identifier travels.
    pub fn on_delete(&self, dashboard: &Dashboard) {
        match dashboard.deletion_key() {
            Ok(key) => self.queue.add(key),
            Err(e) => error!(object = %dashboard.meta, error = %e, "cannot build deletion key"),
        }
    }
}

impl NotificationHandler for Enqueuer {
    fn handle(&self, notification: Notification) {
        match notification {
            Notification::Added(d) => self.on_add(&d),
            Notification::Updated { old, new } => self.on_update(&old, &new),
            Notification::Deleted(d) => self.on_delete(&d),
        }
    }
}
