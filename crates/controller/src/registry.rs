//! Kind registry and the (namespace, name) -> job map.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use smallvec::SmallVec;
use tracing::{debug, error, info, warn, Instrument};
use trellis_core::{Cluster, JobKind, SpecValidationError};

use crate::backoff::BackoffPolicy;
use crate::config::ControllerConfig;
use crate::error::{ConfigError, JobError};
use crate::job::Job;

/// The kinds a deployment is willing to build, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindRegistry {
    enabled: SmallVec<[JobKind; 2]>,
}

impl KindRegistry {
    pub fn new(kinds: &[JobKind]) -> Result<Self, ConfigError> {
        let mut enabled: SmallVec<[JobKind; 2]> = SmallVec::new();
        for kind in kinds {
            if !enabled.contains(kind) {
                enabled.push(*kind);
            }
        }
        if enabled.is_empty() {
            return Err(ConfigError::NoKinds);
        }
        Ok(Self { enabled })
    }

    /// Parse wire kind names (e.g. from a config flag) into a registry.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        let kinds = names.iter().map(|n| n.as_ref().parse::<JobKind>()).collect::<Result<Vec<_>, _>>()?;
        Self::new(&kinds)
    }

    pub fn all() -> Self { Self { enabled: JobKind::ALL.into_iter().collect() } }

    pub fn enabled(&self) -> &[JobKind] { &self.enabled }

    /// Map a kind tag from a custom resource onto an enabled kind.
    pub fn resolve(&self, wire: &str) -> Result<JobKind, SpecValidationError> {
        let kind: JobKind = wire.parse()?;
        if !self.enabled.contains(&kind) {
            return Err(SpecValidationError::KindDisabled(kind));
        }
        Ok(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Resynced,
    Replaced,
}

/// Identity of a tracked job: custom resources are namespaced, so the name alone is not unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: &str, name: &str) -> Self { Self { namespace: namespace.to_string(), name: name.to_string() } }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// Owns every tracked job. All mutation goes through `&mut self`, so check-then-insert is atomic.
///
/// A job whose deletion did not finish stays tracked as deleting; `resync` retries its cleanup.
pub struct JobRegistry {
    cluster: Arc<dyn Cluster>,
    kinds: KindRegistry,
    namespace: String,
    purge: BackoffPolicy,
    jobs: FxHashMap<JobKey, Job>,
    deleting: FxHashSet<JobKey>,
}

impl JobRegistry {
    pub fn new(cluster: Arc<dyn Cluster>, kinds: KindRegistry, config: &ControllerConfig) -> Self {
        Self {
            cluster,
            kinds,
            namespace: config.namespace.clone(),
            purge: config.purge.clone(),
            jobs: FxHashMap::default(),
            deleting: FxHashSet::default(),
        }
    }

    /// Key for `name` in `namespace`, falling back to the configured namespace.
    pub fn key(&self, name: &str, namespace: Option<&str>) -> JobKey { JobKey::new(namespace.unwrap_or(&self.namespace), name) }

    pub fn len(&self) -> usize { self.jobs.len() }
    pub fn is_empty(&self) -> bool { self.jobs.is_empty() }
    pub fn contains(&self, name: &str, namespace: Option<&str>) -> bool { self.jobs.contains_key(&self.key(name, namespace)) }
    pub fn get(&self, name: &str, namespace: Option<&str>) -> Option<&Job> { self.jobs.get(&self.key(name, namespace)) }
    pub fn kinds(&self) -> &KindRegistry { &self.kinds }

    /// Whether the job was deleted but its resources are not confirmed gone yet.
    pub fn is_deleting(&self, name: &str, namespace: Option<&str>) -> bool { self.deleting.contains(&self.key(name, namespace)) }

    pub fn keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.jobs.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn build(&self, key: &JobKey, kind: &str, spec: &Json) -> Result<Job, SpecValidationError> {
        let built = self.kinds.resolve(kind).and_then(|kind| Job::new(&key.name, &key.namespace, kind, spec, self.purge.clone()));
        if let Err(e) = &built {
            counter!("job_spec_rejected_total", 1u64);
            warn!(job = %key, error = %e, "job spec rejected");
        }
        built
    }

    /// Build, purge and reconcile a job for an unseen key. A live job under the same key is left alone.
    ///
    /// A key still being deleted is taken over: the purge before admission sweeps what the old job left behind.
    /// On replica failures the job stays registered (resync retries it) and the failures are returned.
    pub async fn create(&mut self, name: &str, namespace: Option<&str>, kind: &str, spec: &Json) -> Result<CreateOutcome, JobError> {
        let key = self.key(name, namespace);
        if self.jobs.contains_key(&key) && !self.deleting.contains(&key) {
            debug!(job = %key, "job already tracked; ignoring creation event");
            return Ok(CreateOutcome::AlreadyPresent);
        }
        let job = self.build(&key, kind, spec)?;
        self.admit(key, job).await?;
        Ok(CreateOutcome::Created)
    }

    /// Handle a modification: unknown keys are created, identical specs resynced, changed specs replaced.
    pub async fn apply(&mut self, name: &str, namespace: Option<&str>, kind: &str, spec: &Json) -> Result<ApplyOutcome, JobError> {
        let key = self.key(name, namespace);
        let live = self.jobs.get(&key).filter(|_| !self.deleting.contains(&key));
        let Some(existing) = live else {
            let job = self.build(&key, kind, spec)?;
            self.admit(key, job).await?;
            return Ok(ApplyOutcome::Created);
        };
        let resolved = self.kinds.resolve(kind)?;
        if existing.matches(resolved, spec) {
            self.reconcile_one(&key).await?;
            return Ok(ApplyOutcome::Resynced);
        }
        // validate the replacement before tearing anything down
        let replacement = self.build(&key, kind, spec)?;
        info!(job = %key, "spec changed; replacing job");
        if let Err(e) = self.remove(name, namespace).await {
            warn!(job = %key, error = %e, "cleanup of replaced job incomplete");
        }
        self.admit(key, replacement).await?;
        Ok(ApplyOutcome::Replaced)
    }

    async fn admit(&mut self, key: JobKey, job: Job) -> Result<(), JobError> {
        let span = job.span().clone();
        let purged = job.purge(&*self.cluster).instrument(span.clone()).await?;
        info!(parent: &span, replicas = job.replicas().len(), purged, "job created");
        counter!("jobs_created_total", 1u64, "kind" => job.kind().wire_name());
        self.deleting.remove(&key);
        self.jobs.insert(key.clone(), job);
        gauge!("jobs_tracked", self.jobs.len() as f64);
        self.reconcile_one(&key).await
    }

    async fn reconcile_one(&mut self, key: &JobKey) -> Result<(), JobError> {
        let Some(job) = self.jobs.get_mut(key) else { return Ok(()) };
        let span = job.span().clone();
        let started = Instant::now();
        let res = job.reconcile(&*self.cluster).instrument(span).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn teardown(&mut self, key: &JobKey) -> Option<Result<(), JobError>> {
        let job = self.jobs.get_mut(key)?;
        let span = job.span().clone();
        Some(job.cleanup(&*self.cluster).instrument(span).await)
    }

    fn forget(&mut self, key: &JobKey) {
        self.jobs.remove(key);
        self.deleting.remove(key);
        gauge!("jobs_tracked", self.jobs.len() as f64);
        gauge!("jobs_deleting", self.deleting.len() as f64);
    }

    /// Clean up and forget a job. Returns `false` for unknown keys.
    ///
    /// The job leaves the registry only once cleanup succeeds. Otherwise it stays tracked as deleting
    /// and the error is returned; `resync` retries the cleanup.
    pub async fn remove(&mut self, name: &str, namespace: Option<&str>) -> Result<bool, JobError> {
        let key = self.key(name, namespace);
        let Some(res) = self.teardown(&key).await else { return Ok(false) };
        match res {
            Ok(()) => {
                self.forget(&key);
                Ok(true)
            }
            Err(e) => {
                counter!("job_cleanup_deferred_total", 1u64);
                self.deleting.insert(key);
                gauge!("jobs_deleting", self.deleting.len() as f64);
                Err(e)
            }
        }
    }

    /// Reconcile every live job and retry cleanup of deleting ones. Returns how many jobs reported failures.
    pub async fn resync(&mut self) -> usize {
        let mut failed = 0;
        for key in self.keys() {
            let res = if self.deleting.contains(&key) {
                self.remove(&key.name, Some(&key.namespace)).await.map(|_| ())
            } else {
                self.reconcile_one(&key).await
            };
            if let Err(e) = res {
                warn!(job = %key, error = %e, "resync failed");
                failed += 1;
            }
        }
        debug!(jobs = self.jobs.len(), deleting = self.deleting.len(), failed, "resync pass done");
        failed
    }

    /// Best-effort cleanup of every job, used on shutdown. Jobs are forgotten even when cleanup fails.
    pub async fn cleanup_all(&mut self) {
        for key in self.keys() {
            match self.teardown(&key).await {
                Some(Ok(())) => info!(job = %key, "job cleaned up on shutdown"),
                Some(Err(e)) => error!(job = %key, error = %e, "job cleanup on shutdown failed"),
                None => {}
            }
            self.forget(&key);
        }
    }
}
