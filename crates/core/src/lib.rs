//! Trellis core: job kinds, replica naming, desired objects and the replica state machine.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod error;
pub mod event;
pub mod kind;
pub mod naming;
pub mod render;
pub mod replica;
pub mod spec;

pub use cluster::{CallStats, Cluster, MemoryCluster, Selector, JOB_NAME_LABEL, POD_NAME_LABEL};
pub use error::{ok_if_missing, ClusterError, ReplicaError, SpecValidationError};
pub use event::{EventSource, EventStream, EventType, ScriptedSource, WatchCursor, WatchEnvelope, WatchStreamError};
pub use kind::{ClusterMap, EnvPlan, EnvVar, JobKind, KindDescriptor, Role, Topology};
pub use naming::replica_name;
pub use render::ContainerParams;
pub use replica::{Replica, ReplicaStatus};
pub use spec::{JobSpec, ReplicaGroup, ReplicaSpec};

pub mod prelude {
    pub use super::{Cluster, EventSource, JobKind, Replica, ReplicaStatus, Role, Selector, WatchCursor, WatchEnvelope};
}
