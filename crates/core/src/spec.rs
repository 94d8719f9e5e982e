//! Custom-resource spec shape and its validation.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::SpecValidationError;
use crate::kind::{JobKind, KindDescriptor, Role, Topology};

/// One entry of the custom resource's `spec` list, as written by users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    pub replica_type: String,
    pub replicas: u32,
    #[serde(default)]
    pub template: Json,
}

/// A replica spec whose role, count and template have been checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaGroup {
    pub role: Role,
    pub replicas: u32,
    pub template: PodTemplateSpec,
}

/// Validated job spec. Groups keep declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    groups: Vec<ReplicaGroup>,
}

impl JobSpec {
    /// Decode the raw `spec` value of a custom resource.
    pub fn parse(raw: &Json) -> Result<Vec<ReplicaSpec>, SpecValidationError> {
        serde_json::from_value(raw.clone()).map_err(|e| SpecValidationError::Malformed(e.to_string()))
    }

    /// Check every entry against the kind before anything is built from it.
    pub fn validate(descriptor: &KindDescriptor, specs: Vec<ReplicaSpec>) -> Result<Self, SpecValidationError> {
        if descriptor.roles.is_empty() {
            return Err(SpecValidationError::NoReplicaTypes(descriptor.kind));
        }
        if specs.is_empty() {
            return Err(SpecValidationError::EmptySpec);
        }
        let mut groups: Vec<ReplicaGroup> = Vec::with_capacity(specs.len());
        for spec in specs {
            let role = Role::parse(&spec.replica_type)
                .filter(|r| descriptor.allows(*r))
                .ok_or_else(|| SpecValidationError::ReplicaTypeNotAllowed {
                    kind: descriptor.kind,
                    replica_type: spec.replica_type.clone(),
                    allowed: descriptor.allowed_list(),
                })?;
            if groups.iter().any(|g| g.role == role) {
                return Err(SpecValidationError::DuplicateReplicaType(role));
            }
            if spec.replicas == 0 {
                return Err(SpecValidationError::ZeroReplicas(role));
            }
            let template = parse_template(role, spec.template)?;
            groups.push(ReplicaGroup { role, replicas: spec.replicas, template });
        }
        let spec = JobSpec { groups };
        if descriptor.kind == JobKind::ParameterServer {
            let count = spec.topology().count(Role::Scheduler);
            if count != 1 {
                return Err(SpecValidationError::SchedulerCount { kind: descriptor.kind, count });
            }
        }
        Ok(spec)
    }

    pub fn groups(&self) -> &[ReplicaGroup] { &self.groups }

    pub fn topology(&self) -> Topology {
        Topology::from_counts(self.groups.iter().map(|g| (g.role, g.replicas)))
    }
}

fn parse_template(role: Role, raw: Json) -> Result<PodTemplateSpec, SpecValidationError> {
    let invalid = |reason: String| SpecValidationError::InvalidTemplate { role, reason };
    let template: PodTemplateSpec = serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
    match template.spec.as_ref() {
        Some(spec) if !spec.containers.is_empty() => Ok(template),
        Some(_) => Err(invalid("template declares no containers".into())),
        None => Err(invalid("template has no pod spec".into())),
    }
}
