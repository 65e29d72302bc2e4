//! Dark kubehub: GrafanaDashboard resource type and watcher wiring.

#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dark_core::{Dashboard, DashboardStatus, ObjectRef};
use dark_store::DashboardStore;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client, Resource,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub mod report;

pub use report::{KubeEventRecorder, KubeStatusWriter};

pub const GROUP: &str = "k8s.kevingomez.fr";
pub const VERSION: &str = "v1";
pub const KIND: &str = "GrafanaDashboard";
pub const PLURAL: &str = "grafanadashboards";

/// The GrafanaDashboard custom resource. `folder` sits next to `spec`, which
/// holds the dashboard JSON verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrafanaDashboard {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub folder: String,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DashboardStatus>,
}

impl Resource for GrafanaDashboard {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> { Cow::Borrowed(KIND) }
    fn group(_: &()) -> Cow<'_, str> { Cow::Borrowed(GROUP) }
    fn version(_: &()) -> Cow<'_, str> { Cow::Borrowed(VERSION) }
    fn plural(_: &()) -> Cow<'_, str> { Cow::Borrowed(PLURAL) }
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}

/// Project a watched object into the cache representation.
pub fn to_dashboard(obj: &GrafanaDashboard) -> Result<Dashboard> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let raw_spec = serde_json::to_vec(&obj.spec).context("serializing dashboard spec")?;
    Ok(Dashboard {
        meta: ObjectRef {
            namespace: obj.metadata.namespace.clone(),
            name,
            uid: obj.metadata.uid.clone(),
            resource_version: obj.metadata.resource_version.clone(),
        },
        folder: obj.folder.clone(),
        raw_spec,
        status: obj.status.clone(),
    })
}

fn convert(obj: &GrafanaDashboard) -> Option<Dashboard> {
    match to_dashboard(obj) {
        Ok(d) => Some(d),
        Err(e) => {
            error!(error = ?e, "skipping unreadable GrafanaDashboard");
            None
        }
    }
}

/// Feed one watcher event into the store.
pub fn apply_event(store: &DashboardStore, ev: Event<GrafanaDashboard>) {
    match ev {
        Event::Applied(o) => {
            if let Some(d) = convert(&o) {
                store.apply(d);
            }
        }
        Event::Deleted(o) => {
            if let Some(d) = convert(&o) {
                store.delete(d);
            }
        }
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            store.replace(list.iter().filter_map(convert).collect());
        }
    }
}

/// List+watch GrafanaDashboards (all namespaces when `namespace` is `None`)
/// into `store` until the watch stream ends. With `resync` set, every cached
/// object is replayed to the store handlers on that period.
pub async fn run_informer(
    client: Client,
    namespace: Option<&str>,
    store: Arc<DashboardStore>,
    resync: Option<Duration>,
) -> Result<()> {
    let api: Api<GrafanaDashboard> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut ticker = resync
        .filter(|p| !p.is_zero())
        .map(|p| tokio::time::interval_at(tokio::time::Instant::now() + p, p));
    info!(ns = ?namespace, resync_secs = ?resync.map(|d| d.as_secs()), "informer started");

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(ev)) => apply_event(&store, ev),
                Some(Err(e)) => {
                    counter!("watch_errors_total", 1u64);
                    warn!(error = %e, "watch error; backing off");
                }
                None => break,
            },
            _ = tick(&mut ticker) => store.resync(),
        }
    }
    warn!("watcher stream ended");
    Ok(())
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
