//! Dark store: in-RAM cache of GrafanaDashboards fed by the watcher.
//!
//! Readers get `Arc<Dashboard>` snapshots without locking. Writers swap in a
//! new map and then tell the registered handlers what changed.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::ArcSwap;
use dark_core::{Dashboard, Notification, NotificationHandler, ObjectRef};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info};

/// Read access to cached dashboards.
pub trait DashboardLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Dashboard>>;
}

/// Whether a cache finished its initial list.
pub trait HasSynced: Send + Sync {
    fn has_synced(&self) -> bool;
}

#[derive(Debug, Default)]
struct Snapshot {
    epoch: u64,
    items: FxHashMap<String, Arc<Dashboard>>,
}

fn store_key(namespace: Option<&str>, name: &str) -> String {
    ObjectRef::new(namespace, name).to_string()
}

pub struct DashboardStore {
    snap: ArcSwap<Snapshot>,
    write: Mutex<()>,
    handlers: RwLock<Vec<Arc<dyn NotificationHandler>>>,
    synced: watch::Sender<bool>,
}

impl Default for DashboardStore {
    fn default() -> Self { Self::new() }
}

impl DashboardStore {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            snap: ArcSwap::from_pointee(Snapshot::default()),
            write: Mutex::new(()),
            handlers: RwLock::new(Vec::new()),
            synced,
        }
    }

    /// Register a handler for every subsequent change.
    pub fn add_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Dashboard>> {
        let ns = if namespace.is_empty() { None } else { Some(namespace) };
        self.snap.load().items.get(&store_key(ns, name)).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Dashboard>> {
        let mut out: Vec<_> = self.snap.load().items.values().cloned().collect();
        out.sort_by(|a, b| a.meta.namespace.cmp(&b.meta.namespace).then_with(|| a.meta.name.cmp(&b.meta.name)));
        out
    }

    pub fn len(&self) -> usize { self.snap.load().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Incremented on every write.
    pub fn epoch(&self) -> u64 { self.snap.load().epoch }

    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> { self.synced.subscribe() }

    /// Insert or replace one dashboard.
    pub fn apply(&self, dashboard: Dashboard) {
        let _w = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let new = Arc::new(dashboard);
        let key = store_key(new.namespace(), new.name());
        let mut items = self.snap.load().items.clone();
        let old = items.insert(key, Arc::clone(&new));
        self.swap(items);
        match old {
            Some(old) => self.emit(Notification::Updated { old, new }),
            None => self.emit(Notification::Added(new)),
        }
    }

    /// Remove one dashboard; handlers see its final state.
    pub fn delete(&self, dashboard: Dashboard) {
        let _w = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let key = store_key(dashboard.namespace(), dashboard.name());
        let mut items = self.snap.load().items.clone();
        items.remove(&key);
        self.swap(items);
        self.emit(Notification::Deleted(Arc::new(dashboard)));
    }

    /// Replace the whole content with a fresh list and mark the store synced.
    ///
    /// Objects missing from `list` are reported deleted, known ones updated,
    /// unknown ones added.
    pub fn replace(&self, list: Vec<Dashboard>) {
        let _w = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.snap.load_full();
        let mut items = FxHashMap::default();
        let mut changes = Vec::with_capacity(list.len());
        for d in list {
            let new = Arc::new(d);
            let key = store_key(new.namespace(), new.name());
            match previous.items.get(&key) {
                Some(old) => changes.push(Notification::Updated { old: Arc::clone(old), new: Arc::clone(&new) }),
                None => changes.push(Notification::Added(Arc::clone(&new))),
            }
            items.insert(key, new);
        }
        let mut gone: Vec<_> = previous
            .items
            .iter()
            .filter(|(k, _)| !items.contains_key(*k))
            .map(|(_, v)| Arc::clone(v))
            .collect();
        gone.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
        changes.extend(gone.into_iter().map(Notification::Deleted));

        let count = items.len();
        self.swap(items);
        for n in changes {
            self.emit(n);
        }
        if !self.synced.send_replace(true) {
            info!(count, "dashboard cache synced");
        }
    }

    /// Replay every cached dashboard as an update to itself.
    pub fn resync(&self) {
        let _w = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let snap = self.snap.load_full();
        debug!(count = snap.items.len(), "resync");
        for d in snap.items.values() {
            self.emit(Notification::Updated { old: Arc::clone(d), new: Arc::clone(d) });
        }
    }

    fn swap(&self, items: FxHashMap<String, Arc<Dashboard>>) {
        let epoch = self.snap.load().epoch.saturating_add(1);
        gauge!("store_dashboards", items.len() as f64);
        self.snap.store(Arc::new(Snapshot { epoch, items }));
    }

    fn emit(&self, notification: Notification) {
        counter!("store_notifications_total", 1u64, "kind" => notification.kind());
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        for h in handlers.iter() {
            h.handle(notification.clone());
        }
    }
}

impl DashboardLister for DashboardStore {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Dashboard>> { DashboardStore::get(self, namespace, name) }
}

impl HasSynced for DashboardStore {
    fn has_synced(&self) -> bool { DashboardStore::has_synced(self) }
}
