//! Dark core types: the dashboard resource as seen by the controller,
//! work queue keys, cache notifications and collaborator contracts.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod capability;
pub mod keys;

pub use capability::{DashboardCreator, EventRecorder, EventType, ReportError, StatusReporter};
pub use keys::{KeyError, KeyKind, ResourceKey};

/// Identity of a watched object, enough to address it in the API and to
/// attach events to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ObjectRef {
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl ObjectRef {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.to_string(),
            uid: None,
            resource_version: None,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Outcome recorded on the resource after a sync attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncState {
    #[serde(rename = "OK")]
    Ok,
    Error,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Ok => "OK",
            SyncState::Error => "Error",
        }
    }
}

/// Status block persisted back to the resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardStatus {
    pub status: SyncState,
    pub message: String,
}

impl DashboardStatus {
    pub const SYNCHRONIZED: &'static str = "Synchronized";

    pub fn synchronized() -> Self {
        Self { status: SyncState::Ok, message: Self::SYNCHRONIZED.to_string() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { status: SyncState::Error, message: message.into() }
    }
}

/// A GrafanaDashboard as held by the read-only cache.
///
/// The cache hands these out as `Arc<Dashboard>`. Nothing may mutate a cached
/// instance; derive a private copy with [`Dashboard::with_status`] instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dashboard {
    pub meta: ObjectRef,
    /// Grafana folder the dashboard lives in. Empty means the default folder.
    pub folder: String,
    /// Raw dashboard JSON exactly as found in the resource spec.
    pub raw_spec: Vec<u8>,
    pub status: Option<DashboardStatus>,
}

impl Dashboard {
    pub fn namespace(&self) -> Option<&str> { self.meta.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.meta.name }
    pub fn resource_version(&self) -> Option<&str> { self.meta.resource_version.as_deref() }

    /// Work queue key for reconciling this dashboard.
    pub fn reconcile_key(&self) -> Result<ResourceKey, KeyError> {
        ResourceKey::reconcile(self.namespace().unwrap_or(""), self.name())
    }

    /// Work queue key for removing this dashboard once it left the cache.
    ///
    /// Dashboards are provisioned under their resource name, so the name is
    /// the identifier the creator needs to delete them.
    pub fn deletion_key(&self) -> Result<ResourceKey, KeyError> {
        ResourceKey::deletion(self.name())
    }

    /// Deep copy carrying a new status; the receiver is left untouched.
    pub fn with_status(&self, status: DashboardStatus) -> Dashboard {
        let mut copy = self.clone();
        copy.status = Some(status);
        copy
    }
}

/// Change notification emitted by the cache, carrying the concrete resource.
#[derive(Debug, Clone)]
pub enum Notification {
    Added(Arc<Dashboard>),
    Updated { old: Arc<Dashboard>, new: Arc<Dashboard> },
    Deleted(Arc<Dashboard>),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Added(_) => "added",
            Notification::Updated { .. } => "updated",
            Notification::Deleted(_) => "deleted",
        }
    }
}

/// Consumer of cache notifications. Called from whatever task drives the
/// cache, possibly concurrently with workers.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, notification: Notification);
}

pub mod prelude {
    pub use super::{
        Dashboard, DashboardCreator, DashboardStatus, EventRecorder, EventType, KeyError, KeyKind, Notification,
        NotificationHandler, ObjectRef, ReportError, ResourceKey, StatusReporter, SyncState,
    };
}
