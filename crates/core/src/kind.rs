//! Job kinds, replica roles and the per-kind environment algorithms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::error::SpecValidationError;
use crate::naming::replica_name;

/// Port the parameter-server scheduler listens on; every replica of such a job exposes it.
pub const PS_ROOT_PORT: i32 = 9000;
/// Port used by every entry of a parameter/worker cluster map.
pub const PW_PORT: i32 = 2222;
/// Value of `PS_VERBOSE` handed to parameter-server replicas.
pub const PS_VERBOSITY: &str = "2";

/// Replica role. Wire names are lower case and never contain the name separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Scheduler,
    Server,
    Worker,
    Ps,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Scheduler, Role::Server, Role::Worker, Role::Ps];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Scheduler => "scheduler",
            Role::Server => "server",
            Role::Worker => "worker",
            Role::Ps => "ps",
        }
    }

    /// Case-insensitive lookup; surrounding whitespace is ignored.
    pub fn parse(s: &str) -> Option<Role> {
        let s = s.trim();
        Role::ALL.into_iter().find(|r| r.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Closed set of supported job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Scheduler/server/worker topology (`MXJob`).
    #[serde(rename = "MXJob")]
    ParameterServer,
    /// Parameter-server/worker cluster map topology (`TFJob`).
    #[serde(rename = "TFJob")]
    ParameterWorker,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::ParameterServer, JobKind::ParameterWorker];

    /// Kind tag as it appears on the custom resource.
    pub fn wire_name(self) -> &'static str {
        match self {
            JobKind::ParameterServer => "MXJob",
            JobKind::ParameterWorker => "TFJob",
        }
    }

    pub fn from_wire(s: &str) -> Option<JobKind> {
        JobKind::ALL.into_iter().find(|k| k.wire_name().eq_ignore_ascii_case(s.trim()))
    }

    pub fn roles(self) -> &'static [Role] {
        match self {
            JobKind::ParameterServer => &[Role::Scheduler, Role::Server, Role::Worker],
            JobKind::ParameterWorker => &[Role::Ps, Role::Worker],
        }
    }

    /// A fresh descriptor for one job. Descriptors are plain values and never shared between jobs.
    pub fn descriptor(self) -> KindDescriptor {
        KindDescriptor { kind: self, roles: self.roles() }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.wire_name()) }
}

impl FromStr for JobKind {
    type Err = SpecValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::from_wire(s).ok_or_else(|| SpecValidationError::UnknownKind(s.to_string()))
    }
}

/// Per-kind constants: allowed roles, ports and the environment algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindDescriptor {
    pub kind: JobKind,
    pub roles: &'static [Role],
}

impl KindDescriptor {
    pub fn allows(&self, role: Role) -> bool { self.roles.contains(&role) }

    pub fn allowed_list(&self) -> String {
        self.roles.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", ")
    }

    /// Container ports declared by a replica of the given role.
    pub fn container_ports(&self, _role: Role) -> SmallVec<[i32; 2]> {
        match self.kind {
            JobKind::ParameterServer => smallvec![PS_ROOT_PORT],
            JobKind::ParameterWorker => smallvec![PW_PORT],
        }
    }

    /// Resolve the job-wide part of the environment. Counts must already be final.
    pub fn plan(&self, job_name: &str, topology: &Topology) -> EnvPlan {
        match self.kind {
            JobKind::ParameterServer => EnvPlan::ParameterServer {
                root_uri: replica_name(Role::Scheduler, job_name, 0),
                num_server: topology.count(Role::Server),
                num_worker: topology.count(Role::Worker),
            },
            JobKind::ParameterWorker => EnvPlan::ParameterWorker {
                cluster: ClusterMap {
                    ps: cluster_entries(Role::Ps, topology.count(Role::Ps)),
                    worker: cluster_entries(Role::Worker, topology.count(Role::Worker)),
                },
            },
        }
    }
}

fn cluster_entries(role: Role, count: u32) -> Vec<String> {
    (0..count).map(|i| format!("{}{}.{}", role, i, PW_PORT)).collect()
}

/// Replica counts per role, resolved from the whole spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    counts: SmallVec<[(Role, u32); 4]>,
}

impl Topology {
    pub fn from_counts<I: IntoIterator<Item = (Role, u32)>>(counts: I) -> Self {
        let mut t = Topology::default();
        for (role, n) in counts {
            match t.counts.iter_mut().find(|(r, _)| *r == role) {
                Some((_, total)) => *total += n,
                None => t.counts.push((role, n)),
            }
        }
        t
    }

    pub fn count(&self, role: Role) -> u32 {
        self.counts.iter().find(|(r, _)| *r == role).map(|(_, n)| *n).unwrap_or(0)
    }

    pub fn total(&self) -> u32 { self.counts.iter().map(|(_, n)| n).sum() }
}

/// One environment variable handed to a replica's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Global view of a parameter/worker job, identical for all of its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMap {
    pub ps: Vec<String>,
    pub worker: Vec<String>,
}

#[derive(Serialize)]
struct TaskRef {
    #[serde(rename = "type")]
    role: Role,
    index: u32,
}

#[derive(Serialize)]
struct ClusterConfig<'a> {
    cluster: &'a ClusterMap,
    task: TaskRef,
}

/// Job-wide environment inputs; `environment` specialises it per replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvPlan {
    ParameterServer { root_uri: String, num_server: u32, num_worker: u32 },
    ParameterWorker { cluster: ClusterMap },
}

impl EnvPlan {
    pub fn environment(&self, role: Role, uid: u32) -> Result<Vec<EnvVar>, SpecValidationError> {
        match self {
            EnvPlan::ParameterServer { root_uri, num_server, num_worker } => Ok(vec![
                EnvVar::new("DMLC_ROLE", role.as_str()),
                EnvVar::new("DMLC_PS_ROOT_URI", root_uri.as_str()),
                EnvVar::new("DMLC_PS_ROOT_PORT", PS_ROOT_PORT.to_string()),
                EnvVar::new("DMLC_NUM_SERVER", num_server.to_string()),
                EnvVar::new("DMLC_NUM_WORKER", num_worker.to_string()),
                EnvVar::new("PS_VERBOSE", PS_VERBOSITY),
            ]),
            EnvPlan::ParameterWorker { cluster } => {
                let config = ClusterConfig { cluster, task: TaskRef { role, index: uid } };
                let encoded = serde_json::to_string(&config)
                    .map_err(|e| SpecValidationError::Encode(e.to_string()))?;
                Ok(vec![EnvVar::new("TF_CONFIG", encoded)])
            }
        }
    }
}
