//! Replica: one desired pod plus an optional service, reconciled by label selector.

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec, Service};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cluster::{Cluster, Selector};
use crate::error::{ok_if_exists, ok_if_missing, ReplicaError};
use crate::kind::Role;
use crate::naming::replica_name;
use crate::render::{desired_pod, desired_service, ContainerParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaStatus {
    Unknown,
    Creating,
    Present,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Replica {
    uid: u32,
    name: String,
    role: Role,
    job_name: String,
    namespace: String,
    params: ContainerParams,
    pod: Pod,
    service: Option<Service>,
    status: ReplicaStatus,
}

impl Replica {
    pub fn new(uid: u32, role: Role, job_name: &str, namespace: &str, template: &PodTemplateSpec, params: ContainerParams) -> Self {
        let name = replica_name(role, job_name, uid);
        let pod = desired_pod(&name, namespace, job_name, template, &params);
        let service = desired_service(&name, namespace, job_name, &params.ports);
        Self {
            uid,
            name,
            role,
            job_name: job_name.to_string(),
            namespace: namespace.to_string(),
            params,
            pod,
            service,
            status: ReplicaStatus::Unknown,
        }
    }

    pub fn uid(&self) -> u32 { self.uid }
    pub fn name(&self) -> &str { &self.name }
    pub fn role(&self) -> Role { self.role }
    pub fn job_name(&self) -> &str { &self.job_name }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn params(&self) -> &ContainerParams { &self.params }
    pub fn pod(&self) -> &Pod { &self.pod }
    pub fn service(&self) -> Option<&Service> { self.service.as_ref() }
    pub fn status(&self) -> ReplicaStatus { self.status }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.params.env.iter().find(|e| e.name == name).map(|e| e.value.as_str())
    }

    pub fn selector(&self) -> Selector { Selector::replica(&self.job_name, &self.name) }

    /// Bring the cluster in line with this replica. Idempotent.
    pub async fn reconcile(&mut self, cluster: &dyn Cluster) -> Result<ReplicaStatus, ReplicaError> {
        if self.status == ReplicaStatus::Deleted {
            debug!(replica = %self.name, "replica already deleted; skipping reconcile");
            return Ok(self.status);
        }
        let selector = self.selector();
        let matches = cluster.list_pods(&self.namespace, &selector).await?;
        match (matches.len(), self.status) {
            (0, ReplicaStatus::Present) => {
                // Present -> Creating is not a legal transition; surface it and leave the replica alone.
                warn!(replica = %self.name, "pod disappeared after it was observed present");
                counter!("replica_vanished_total", 1u64);
            }
            (0, _) => self.create(cluster).await?,
            (1, ReplicaStatus::Creating) => {
                // pod made it but the service may not have
                self.ensure_service(cluster).await?;
                self.status = ReplicaStatus::Present;
            }
            (1, _) => {
                debug!(replica = %self.name, pod = %matches[0], "replica pod already exists");
                self.status = ReplicaStatus::Present;
            }
            (count, _) => return Err(self.invariant_violation(&selector, count)),
        }
        Ok(self.status)
    }

    async fn create(&mut self, cluster: &dyn Cluster) -> Result<(), ReplicaError> {
        self.status = ReplicaStatus::Creating;
        ok_if_exists(cluster.create_pod(&self.namespace, &self.pod).await)?;
        counter!("replica_create_total", 1u64, "role" => self.role.as_str());
        self.ensure_service(cluster).await?;
        self.status = ReplicaStatus::Present;
        info!(replica = %self.name, role = %self.role, service = self.service.is_some(), "replica created");
        Ok(())
    }

    async fn ensure_service(&self, cluster: &dyn Cluster) -> Result<(), ReplicaError> {
        if let Some(service) = &self.service {
            ok_if_exists(cluster.create_service(&self.namespace, service).await)?;
        }
        Ok(())
    }

    /// Delete this replica's pod and service. A missing pod is not an error.
    pub async fn cleanup(&mut self, cluster: &dyn Cluster) -> Result<(), ReplicaError> {
        let selector = self.selector();
        let matches = cluster.list_pods(&self.namespace, &selector).await?;
        match matches.len() {
            0 => debug!(replica = %self.name, "no pod found during cleanup"),
            1 => {
                ok_if_missing(cluster.delete_pod(&self.namespace, &matches[0]).await)?;
                counter!("replica_delete_total", 1u64);
                info!(replica = %self.name, "replica pod deleted");
            }
            count => return Err(self.invariant_violation(&selector, count)),
        }
        if self.service.is_some() {
            ok_if_missing(cluster.delete_service(&self.namespace, &self.name).await)?;
        }
        self.status = ReplicaStatus::Deleted;
        Ok(())
    }

    fn invariant_violation(&self, selector: &Selector, count: usize) -> ReplicaError {
        error!(replica = %self.name, selector = %selector, count, "selector matched more than one pod");
        counter!("replica_invariant_violations_total", 1u64);
        ReplicaError::InvariantViolation { selector: selector.to_string(), count }
    }
}
