//! Trellis kubehub: the kube-backed cluster client and the custom-resource watch.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, WatchEvent},
    Client,
};
use metrics::counter;
use serde_json::json;
use tracing::{debug, info};
use trellis_core::{
    Cluster, ClusterError, EventSource, EventStream, JobKind, Selector, WatchCursor, WatchEnvelope, WatchStreamError,
};

/// Build a client from the in-cluster environment or the local kubeconfig.
pub async fn connect() -> Result<Client> {
    Client::try_default().await.context("building kube client (in-cluster config or kubeconfig)")
}

fn classify(e: kube::Error, kind: &'static str, name: &str) -> ClusterError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::AlreadyExists { kind, name: name.to_string() },
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound { kind, name: name.to_string() },
        other => ClusterError::Api(format!("{kind} {name}: {other}")),
    }
}

/// [`Cluster`] over the pod and service APIs.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    fn pods(&self, namespace: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), namespace) }
    fn services(&self, namespace: &str) -> Api<Service> { Api::namespaced(self.client.clone(), namespace) }
}

fn selected(selector: &Selector) -> ListParams { ListParams::default().labels(&selector.to_string()) }

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<String>, ClusterError> {
        let list = self.pods(namespace).list(&selected(selector)).await.map_err(|e| classify(e, "pod", &selector.to_string()))?;
        Ok(list.items.into_iter().filter_map(|p| p.metadata.name).collect())
    }

    async fn list_services(&self, namespace: &str, selector: &Selector) -> Result<Vec<String>, ClusterError> {
        let list = self
            .services(namespace)
            .list(&selected(selector))
            .await
            .map_err(|e| classify(e, "service", &selector.to_string()))?;
        Ok(list.items.into_iter().filter_map(|s| s.metadata.name).collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), ClusterError> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.pods(namespace).create(&PostParams::default(), pod).await.map_err(|e| classify(e, "pod", name))?;
        debug!(pod = %name, ns = %namespace, "pod created");
        Ok(())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), ClusterError> {
        let name = service.metadata.name.as_deref().unwrap_or_default();
        self.services(namespace).create(&PostParams::default(), service).await.map_err(|e| classify(e, "service", name))?;
        debug!(service = %name, ns = %namespace, "service created");
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.pods(namespace).delete(name, &DeleteParams::background()).await.map_err(|e| classify(e, "pod", name))?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.services(namespace).delete(name, &DeleteParams::background()).await.map_err(|e| classify(e, "service", name))?;
        Ok(())
    }
}

/// The custom resource a controller watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResource {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: JobKind,
}

impl JobResource {
    /// Conventional plural: lower-cased kind plus `s` (`TFJob` -> `tfjobs`).
    pub fn for_kind(group: &str, version: &str, kind: JobKind) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: format!("{}s", kind.wire_name().to_ascii_lowercase()),
            kind,
        }
    }

    pub fn with_plural(mut self, plural: &str) -> Self {
        self.plural = plural.to_string();
        self
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, self.kind.wire_name());
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

/// [`EventSource`] over a raw `watch` of one custom resource.
///
/// Each `watch` call is one server-side session bounded by `timeout_secs`; the
/// control loop reconnects from its cursor when the session ends.
pub struct KubeJobSource {
    api: Api<DynamicObject>,
    resource: JobResource,
    timeout_secs: u32,
}

impl KubeJobSource {
    /// Watch `resource` in `namespace`, or across all namespaces when `None`.
    pub fn new(client: Client, resource: JobResource, namespace: Option<&str>, timeout_secs: u32) -> Self {
        let ar = resource.api_resource();
        let api = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        };
        Self { api, resource, timeout_secs }
    }

    pub fn resource(&self) -> &JobResource { &self.resource }
}

#[async_trait::async_trait]
impl EventSource for KubeJobSource {
    async fn watch(&self, cursor: &WatchCursor) -> Result<EventStream, WatchStreamError> {
        let params = WatchParams::default().timeout(self.timeout_secs);
        // "0" asks for the current state as synthetic ADDED events, then changes
        let version = cursor.resource_version().unwrap_or("0");
        let stream = self.api.watch(&params, version).await.map_err(open_error)?;
        info!(plural = %self.resource.plural, group = %self.resource.group, version, "watch session opened");
        Ok(stream.map(translate).boxed())
    }
}

fn open_error(e: kube::Error) -> WatchStreamError {
    match e {
        kube::Error::Api(ae) if ae.code == 410 => WatchStreamError::Expired,
        other => WatchStreamError::Disconnected(other.to_string()),
    }
}

fn envelope(event_type: &str, obj: DynamicObject) -> Result<WatchEnvelope, WatchStreamError> {
    let object = serde_json::to_value(&obj).map_err(|e| WatchStreamError::Decode(e.to_string()))?;
    WatchEnvelope::parse(&json!({ "type": event_type, "object": object }))
}

/// Map one raw watch item onto the controller's envelope.
pub fn translate(item: Result<WatchEvent<DynamicObject>, kube::Error>) -> Result<WatchEnvelope, WatchStreamError> {
    let event = match item {
        Ok(event) => event,
        Err(kube::Error::SerdeError(e)) => return Err(WatchStreamError::Decode(e.to_string())),
        Err(e) => return Err(open_error(e)),
    };
    let kind = match &event {
        WatchEvent::Added(_) => "ADDED",
        WatchEvent::Modified(_) => "MODIFIED",
        WatchEvent::Deleted(_) => "DELETED",
        WatchEvent::Bookmark(_) => "BOOKMARK",
        WatchEvent::Error(_) => "ERROR",
    };
    counter!("watch_events_total", 1u64, "type" => kind);
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => envelope(kind, obj),
        WatchEvent::Bookmark(b) => Ok(WatchEnvelope::bookmark(b.metadata.resource_version)),
        WatchEvent::Error(ae) if ae.code == 410 => Err(WatchStreamError::Expired),
        WatchEvent::Error(ae) => Err(WatchStreamError::Disconnected(format!("{} ({}): {}", ae.reason, ae.code, ae.message))),
    }
}
