//! Error taxonomy shared by the core and the controller.

use thiserror::Error;

use crate::kind::{JobKind, Role};

/// A job spec was rejected before any cluster resource was touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecValidationError {
    #[error("unknown job kind {0:?}")]
    UnknownKind(String),
    #[error("job kind {0} is not enabled in this deployment")]
    KindDisabled(JobKind),
    #[error("job kind {0} declares no replica types")]
    NoReplicaTypes(JobKind),
    #[error("malformed job spec: {0}")]
    Malformed(String),
    #[error("job spec lists no replicas")]
    EmptySpec,
    #[error("replica type {replica_type:?} is not allowed for {kind} (allowed: {allowed})")]
    ReplicaTypeNotAllowed { kind: JobKind, replica_type: String, allowed: String },
    #[error("replica type {0} is declared more than once")]
    DuplicateReplicaType(Role),
    #[error("replica type {0} requests zero replicas")]
    ZeroReplicas(Role),
    #[error("invalid pod template for {role}: {reason}")]
    InvalidTemplate { role: Role, reason: String },
    #[error("{kind} needs exactly one scheduler replica, got {count}")]
    SchedulerCount { kind: JobKind, count: u32 },
    #[error("failed to encode replica environment: {0}")]
    Encode(String),
}

/// Failure reported by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// Create of an object that is already there; callers treat it as success.
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    /// Delete of an object that is already gone; callers treat it as success.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("cluster api: {0}")]
    Api(String),
}

/// Outcome of a single replica reconcile or cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    /// More than one pod matched a selector that must be unique.
    #[error("invariant violation: {count} pods match {selector}")]
    InvariantViolation { selector: String, count: usize },
}

impl ReplicaError {
    pub fn is_invariant_violation(&self) -> bool { matches!(self, ReplicaError::InvariantViolation { .. }) }
}

pub(crate) fn ok_if_exists(res: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match res {
        Err(ClusterError::AlreadyExists { .. }) => Ok(()),
        other => other,
    }
}

pub fn ok_if_missing(res: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match res {
        Err(ClusterError::NotFound { .. }) => Ok(()),
        other => other,
    }
}
