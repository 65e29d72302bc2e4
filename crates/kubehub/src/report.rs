//! Status and event writers backed by the Kubernetes API.

use async_trait::async_trait;
use dark_core::{Dashboard, EventRecorder, EventType, ObjectRef, ReportError, StatusReporter};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter},
    Client, Resource,
};
use metrics::counter;
use tracing::{info, warn};

use crate::GrafanaDashboard;

pub const CONTROLLER_NAME: &str = "dark-controller";

fn report_error(object: &ObjectRef, e: kube::Error) -> ReportError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ReportError::NotFound(object.to_string()),
        kube::Error::Api(resp) => ReportError::Rejected(resp.message),
        other => ReportError::Transport(other.to_string()),
    }
}

/// Merge-patches the `status` subresource.
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl StatusReporter for KubeStatusWriter {
    async fn update_status(&self, dashboard: &Dashboard) -> Result<(), ReportError> {
        let Some(ns) = dashboard.namespace() else {
            return Err(ReportError::Rejected(format!("{} has no namespace", dashboard.meta)));
        };
        let api: Api<GrafanaDashboard> = Api::namespaced(self.client.clone(), ns);
        let patch = serde_json::json!({ "status": dashboard.status });
        api.patch_status(dashboard.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| report_error(&dashboard.meta, e))
    }
}

/// Publishes Kubernetes Events on GrafanaDashboards.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter { controller: CONTROLLER_NAME.to_string(), instance: std::env::var("HOSTNAME").ok() };
        Self { client, reporter }
    }
}

pub fn object_reference(object: &ObjectRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(GrafanaDashboard::api_version(&()).into_owned()),
        kind: Some(GrafanaDashboard::kind(&()).into_owned()),
        name: Some(object.name.clone()),
        namespace: object.namespace.clone(),
        uid: object.uid.clone(),
        resource_version: object.resource_version.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record_event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        info!(object = %object, kind = %event_type, reason, message, "event");
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object_reference(object));
        let ev = Event {
            type_: match event_type {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Sync".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            counter!("events_failed_total", 1u64);
            warn!(object = %object, error = %e, "failed to publish event");
        }
    }
}
