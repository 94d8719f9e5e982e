//! A training job: its validated spec expanded into replicas.

use serde_json::Value as Json;
use tracing::{info, info_span, warn, Span};
use trellis_core::{
    ok_if_missing, Cluster, ClusterError, ContainerParams, JobKind, JobSpec, KindDescriptor, Replica, Role, Selector,
    SpecValidationError,
};

use crate::backoff::BackoffPolicy;
use crate::error::{JobError, ReplicaFailure};

pub struct Job {
    name: String,
    namespace: String,
    descriptor: KindDescriptor,
    raw_spec: Json,
    replicas: Vec<Replica>,
    policy: BackoffPolicy,
    span: Span,
}

impl Job {
    /// Validate `raw_spec` against `kind` and expand it. Nothing touches the cluster here.
    pub fn new(name: &str, namespace: &str, kind: JobKind, raw_spec: &Json, policy: BackoffPolicy) -> Result<Self, SpecValidationError> {
        let descriptor = kind.descriptor();
        let spec = JobSpec::validate(&descriptor, JobSpec::parse(raw_spec)?)?;
        let replicas = create_replicas(name, namespace, &descriptor, &spec)?;
        let span = info_span!("job", job = %name, kind = %kind, ns = %namespace);
        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            descriptor,
            raw_spec: raw_spec.clone(),
            replicas,
            policy,
            span,
        })
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn kind(&self) -> JobKind { self.descriptor.kind }
    pub fn allowed_roles(&self) -> &'static [Role] { self.descriptor.roles }
    pub fn replicas(&self) -> &[Replica] { &self.replicas }
    pub fn span(&self) -> &Span { &self.span }

    pub fn replica(&self, name: &str) -> Option<&Replica> { self.replicas.iter().find(|r| r.name() == name) }

    /// Whether this job was built from exactly this kind and spec.
    pub fn matches(&self, kind: JobKind, raw_spec: &Json) -> bool {
        self.descriptor.kind == kind && &self.raw_spec == raw_spec
    }

    /// Remove everything labelled with this job's name, known replica or not, and wait until it is gone.
    pub async fn purge(&self, cluster: &dyn Cluster) -> Result<usize, JobError> {
        let selector = Selector::job(&self.name);
        let pods = cluster.list_pods(&self.namespace, &selector).await?;
        let services = cluster.list_services(&self.namespace, &selector).await?;
        if pods.is_empty() && services.is_empty() {
            return Ok(0);
        }
        info!(pods = pods.len(), services = services.len(), "deleting resources left over under this job name");
        for pod in &pods {
            ok_if_missing(cluster.delete_pod(&self.namespace, pod).await)?;
        }
        for svc in &services {
            ok_if_missing(cluster.delete_service(&self.namespace, svc).await)?;
        }
        let what = format!("resources of job {}", self.name);
        let (ns, selector) = (self.namespace.as_str(), &selector);
        self.policy.wait_until_empty(&what, move || async move { labelled_count(cluster, ns, selector).await }).await?;
        Ok(pods.len() + services.len())
    }

    /// Reconcile every replica in order. One failure never stops the others.
    pub async fn reconcile(&mut self, cluster: &dyn Cluster) -> Result<(), JobError> {
        let mut failures = Vec::new();
        for replica in &mut self.replicas {
            if let Err(error) = replica.reconcile(cluster).await {
                warn!(replica = %replica.name(), error = %error, "replica reconcile failed");
                failures.push(ReplicaFailure { replica: replica.name().to_string(), error });
            }
        }
        if failures.is_empty() { Ok(()) } else { Err(JobError::Replicas(failures)) }
    }

    /// Best-effort teardown of every replica, then a sweep of anything else labelled with the job.
    pub async fn cleanup(&mut self, cluster: &dyn Cluster) -> Result<(), JobError> {
        let mut failures = Vec::new();
        for replica in &mut self.replicas {
            if let Err(error) = replica.cleanup(cluster).await {
                warn!(replica = %replica.name(), error = %error, "replica cleanup failed");
                failures.push(ReplicaFailure { replica: replica.name().to_string(), error });
            }
        }
        if !failures.is_empty() {
            return Err(JobError::Cleanup(failures));
        }
        let swept = self.purge(cluster).await?;
        info!(replicas = self.replicas.len(), swept, "job cleaned up");
        Ok(())
    }
}

fn create_replicas(name: &str, namespace: &str, descriptor: &KindDescriptor, spec: &JobSpec) -> Result<Vec<Replica>, SpecValidationError> {
    let plan = descriptor.plan(name, &spec.topology());
    let mut replicas = Vec::with_capacity(spec.topology().total() as usize);
    for group in spec.groups() {
        for uid in 0..group.replicas {
            let params = ContainerParams {
                env: plan.environment(group.role, uid)?,
                ports: descriptor.container_ports(group.role),
                volume_mounts: Vec::new(),
            };
            replicas.push(Replica::new(uid, group.role, name, namespace, &group.template, params));
        }
    }
    Ok(replicas)
}

async fn labelled_count(cluster: &dyn Cluster, namespace: &str, selector: &Selector) -> Result<usize, ClusterError> {
    let pods = cluster.list_pods(namespace, selector).await?;
    let services = cluster.list_services(namespace, selector).await?;
    Ok(pods.len() + services.len())
}
