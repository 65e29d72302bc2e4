//! Contracts for the collaborators the reconciler drives.

use std::fmt;

use async_trait::async_trait;

use crate::{Dashboard, ObjectRef};

/// Turns raw dashboard specs into dashboards in the target system.
#[async_trait]
pub trait DashboardCreator: Send + Sync {
    /// Create or update the dashboard identified by `uid` in `folder`.
    async fn from_raw_spec(&self, folder: &str, uid: &str, raw_spec: &[u8]) -> anyhow::Result<()>;

    async fn delete(&self, uid: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport: {0}")]
    Transport(String),
}

/// Persists the status block of a dashboard.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Write `dashboard.status`. `dashboard` is a private copy, never a cached object.
    async fn update_status(&self, dashboard: &Dashboard) -> Result<(), ReportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        })
    }
}

/// Emits human-visible events about an object. Best effort: implementations
/// log their own failures.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record_event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str);
}
