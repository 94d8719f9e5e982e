//! The cluster API seam and an in-process implementation of it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::ClusterError;

pub const JOB_NAME_LABEL: &str = "job_name";
pub const POD_NAME_LABEL: &str = "pod_name";

/// Exact-match label selector over `job_name` and, optionally, `pod_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub job_name: String,
    pub pod_name: Option<String>,
}

impl Selector {
    /// Everything labelled as belonging to a job.
    pub fn job(job_name: &str) -> Self { Self { job_name: job_name.to_string(), pod_name: None } }

    pub fn replica(job_name: &str, replica_name: &str) -> Self {
        Self { job_name: job_name.to_string(), pod_name: Some(replica_name.to_string()) }
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let Some(labels) = labels else { return false };
        labels.get(JOB_NAME_LABEL) == Some(&self.job_name)
            && self.pod_name.as_ref().map_or(true, |p| labels.get(POD_NAME_LABEL) == Some(p))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", JOB_NAME_LABEL, self.job_name)?;
        if let Some(pod) = &self.pod_name {
            write!(f, ",{}={}", POD_NAME_LABEL, pod)?;
        }
        Ok(())
    }
}

/// Opaque, transactional view of the orchestration API.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Names of the pods matching `selector`.
    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<String>, ClusterError>;
    /// Names of the services matching `selector`.
    async fn list_services(&self, namespace: &str, selector: &Selector) -> Result<Vec<String>, ClusterError>;
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), ClusterError>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), ClusterError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// Counters of calls seen by a [`MemoryCluster`]: list queries plus every accepted mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub lists: u64,
    pub pod_creates: u64,
    pub service_creates: u64,
    pub pod_deletes: u64,
    pub service_deletes: u64,
}

#[derive(Default)]
struct MemState {
    pods: BTreeMap<(String, String), Pod>,
    services: BTreeMap<(String, String), Service>,
    stats: CallStats,
    stall_deletes: bool,
    fail_creates: bool,
}

/// In-process cluster used by tests and offline rendering.
///
/// Deletes can be stalled to mimic objects held by finalizers, and creates can be
/// failed to exercise error paths.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<MemState>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MemState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Seed a pod directly, bypassing stats. Used to simulate stale or foreign objects.
    pub fn insert_pod(&self, namespace: &str, name: &str, labels: BTreeMap<String, String>) {
        let pod = Pod {
            metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), labels: Some(labels), ..Default::default() },
            ..Default::default()
        };
        self.state().pods.insert((namespace.to_string(), name.to_string()), pod);
    }

    /// Drop a pod as if something outside the controller deleted it.
    pub fn evict_pod(&self, namespace: &str, name: &str) -> bool {
        self.state().pods.remove(&(namespace.to_string(), name.to_string())).is_some()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state().pods.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state().services.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn pod_names(&self, namespace: &str) -> Vec<String> {
        self.state().pods.keys().filter(|(ns, _)| ns == namespace).map(|(_, n)| n.clone()).collect()
    }

    pub fn service_names(&self, namespace: &str) -> Vec<String> {
        self.state().services.keys().filter(|(ns, _)| ns == namespace).map(|(_, n)| n.clone()).collect()
    }

    pub fn stats(&self) -> CallStats { self.state().stats }

    /// While set, deletes are accepted but objects stay in place.
    pub fn set_stall_deletes(&self, on: bool) { self.state().stall_deletes = on; }

    /// While set, every create fails with a non-transient API error.
    pub fn set_fail_creates(&self, on: bool) { self.state().fail_creates = on; }
}

#[async_trait::async_trait]
impl Cluster for MemoryCluster {
    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<String>, ClusterError> {
        let mut st = self.state();
        st.stats.lists += 1;
        Ok(st.pods
            .iter()
            .filter(|((ns, _), p)| ns == namespace && selector.matches(p.metadata.labels.as_ref()))
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    async fn list_services(&self, namespace: &str, selector: &Selector) -> Result<Vec<String>, ClusterError> {
        let mut st = self.state();
        st.stats.lists += 1;
        Ok(st.services
            .iter()
            .filter(|((ns, _), s)| ns == namespace && selector.matches(s.metadata.labels.as_ref()))
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), ClusterError> {
        let mut st = self.state();
        let name = pod.metadata.name.clone().ok_or_else(|| ClusterError::Api("pod without a name".into()))?;
        if st.fail_creates {
            return Err(ClusterError::Api(format!("create pod {name}: injected failure")));
        }
        let key = (namespace.to_string(), name.clone());
        if st.pods.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind: "pod", name });
        }
        st.stats.pod_creates += 1;
        st.pods.insert(key, pod.clone());
        Ok(())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), ClusterError> {
        let mut st = self.state();
        let name = service.metadata.name.clone().ok_or_else(|| ClusterError::Api("service without a name".into()))?;
        if st.fail_creates {
            return Err(ClusterError::Api(format!("create service {name}: injected failure")));
        }
        let key = (namespace.to_string(), name.clone());
        if st.services.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind: "service", name });
        }
        st.stats.service_creates += 1;
        st.services.insert(key, service.clone());
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut st = self.state();
        let key = (namespace.to_string(), name.to_string());
        if !st.pods.contains_key(&key) {
            return Err(ClusterError::NotFound { kind: "pod", name: name.to_string() });
        }
        st.stats.pod_deletes += 1;
        if !st.stall_deletes {
            st.pods.remove(&key);
        }
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut st = self.state();
        let key = (namespace.to_string(), name.to_string());
        if !st.services.contains_key(&key) {
            return Err(ClusterError::NotFound { kind: "service", name: name.to_string() });
        }
        st.stats.service_deletes += 1;
        if !st.stall_deletes {
            st.services.remove(&key);
        }
        Ok(())
    }
}
