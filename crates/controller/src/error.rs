use std::time::Duration;

use thiserror::Error;
use trellis_core::{ClusterError, ReplicaError, SpecValidationError};

/// Resources were still present when the retry budget ran out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{what}: {remaining} resource(s) still present after {elapsed:?}")]
pub struct ConvergenceTimeout {
    pub what: String,
    pub remaining: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{replica}: {error}")]
pub struct ReplicaFailure {
    pub replica: String,
    pub error: ReplicaError,
}

fn summarize(failures: &[ReplicaFailure]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error(transparent)]
    Spec(#[from] SpecValidationError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Convergence(#[from] ConvergenceTimeout),
    #[error("{} replica(s) failed to reconcile: {}", .0.len(), summarize(.0))]
    Replicas(Vec<ReplicaFailure>),
    #[error("{} replica(s) failed to clean up: {}", .0.len(), summarize(.0))]
    Cleanup(Vec<ReplicaFailure>),
}

impl JobError {
    /// Per-replica failures carried by this error, if any.
    pub fn failures(&self) -> &[ReplicaFailure] {
        match self {
            JobError::Replicas(f) | JobError::Cleanup(f) => f,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no job kinds enabled")]
    NoKinds,
    #[error(transparent)]
    Kind(#[from] SpecValidationError),
}
