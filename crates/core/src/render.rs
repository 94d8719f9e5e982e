//! Desired Pod/Service objects for a replica.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar as KubeEnvVar, Pod, PodTemplateSpec, Service, ServicePort, ServiceSpec, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use smallvec::SmallVec;

use crate::cluster::{JOB_NAME_LABEL, POD_NAME_LABEL};
use crate::kind::EnvVar;

/// Container-level parameters injected into the first container of a replica's pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerParams {
    pub env: Vec<EnvVar>,
    pub ports: SmallVec<[i32; 2]>,
    pub volume_mounts: Vec<VolumeMount>,
}

pub fn replica_labels(job_name: &str, replica_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (JOB_NAME_LABEL.to_string(), job_name.to_string()),
        (POD_NAME_LABEL.to_string(), replica_name.to_string()),
    ])
}

/// Pod built from the template: template labels are kept, ours win on conflict.
pub fn desired_pod(name: &str, namespace: &str, job_name: &str, template: &PodTemplateSpec, params: &ContainerParams) -> Pod {
    let template_meta = template.metadata.clone().unwrap_or_default();
    let mut labels = template_meta.labels.clone().unwrap_or_default();
    labels.extend(replica_labels(job_name, name));

    let mut spec = template.spec.clone().unwrap_or_default();
    if let Some(container) = spec.containers.first_mut() {
        apply_params(container, params);
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: template_meta.annotations,
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

fn apply_params(container: &mut Container, params: &ContainerParams) {
    if !params.env.is_empty() {
        let mut env = container.env.take().unwrap_or_default();
        env.retain(|e| !params.env.iter().any(|p| p.name == e.name));
        env.extend(params.env.iter().map(|e| KubeEnvVar { name: e.name.clone(), value: Some(e.value.clone()), value_from: None }));
        container.env = Some(env);
    }
    if !params.ports.is_empty() {
        let mut ports = container.ports.take().unwrap_or_default();
        for port in &params.ports {
            if !ports.iter().any(|p| p.container_port == *port) {
                ports.push(ContainerPort { container_port: *port, ..Default::default() });
            }
        }
        container.ports = Some(ports);
    }
    if !params.volume_mounts.is_empty() {
        let mut mounts = container.volume_mounts.take().unwrap_or_default();
        mounts.extend(params.volume_mounts.iter().cloned());
        container.volume_mounts = Some(mounts);
    }
}

/// Service fronting the replica's pod; only replicas that declare ports get one.
pub fn desired_service(name: &str, namespace: &str, job_name: &str, ports: &[i32]) -> Option<Service> {
    if ports.is_empty() {
        return None;
    }
    let labels = replica_labels(job_name, name);
    Some(Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(
                ports
                    .iter()
                    .enumerate()
                    .map(|(i, port)| ServicePort { name: Some(format!("dlport{i}")), port: *port, ..Default::default() })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    })
}
