#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};
use trellis_controller::{BackoffPolicy, ControllerConfig, JobRegistry, KindRegistry};
use trellis_core::{MemoryCluster, WatchEnvelope};

pub fn entry(role: &str, replicas: u32) -> Json {
    json!({
        "replicaType": role,
        "replicas": replicas,
        "template": {"spec": {"containers": [{"name": "main", "image": "trainer:1"}]}}
    })
}

pub fn ps_spec(schedulers: u32, servers: u32, workers: u32) -> Json {
    json!([entry("scheduler", schedulers), entry("server", servers), entry("worker", workers)])
}

pub fn pw_spec(ps: u32, workers: u32) -> Json {
    json!([entry("ps", ps), entry("worker", workers)])
}

pub fn config() -> ControllerConfig {
    ControllerConfig {
        namespace: "ml".to_string(),
        purge: BackoffPolicy {
            initial: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2,
            deadline: Duration::from_millis(50),
        },
        reconnect: BackoffPolicy {
            initial: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2,
            deadline: Duration::MAX,
        },
        resync_interval: None,
        ..ControllerConfig::default()
    }
}

pub fn registry(cluster: &Arc<MemoryCluster>) -> JobRegistry {
    let cfg = config();
    JobRegistry::new(cluster.clone(), KindRegistry::new(&cfg.kinds).unwrap(), &cfg)
}

pub fn event(kind: &str, name: &str, job_kind: &str, rv: &str, spec: Option<Json>) -> WatchEnvelope {
    envelope(kind, json!({"name": name, "resourceVersion": rv}), job_kind, spec)
}

pub fn event_in(namespace: &str, kind: &str, name: &str, job_kind: &str, rv: &str, spec: Option<Json>) -> WatchEnvelope {
    envelope(kind, json!({"name": name, "namespace": namespace, "resourceVersion": rv}), job_kind, spec)
}

fn envelope(kind: &str, metadata: Json, job_kind: &str, spec: Option<Json>) -> WatchEnvelope {
    let mut object = json!({"kind": job_kind, "metadata": metadata});
    if let Some(spec) = spec {
        object["spec"] = spec;
    }
    WatchEnvelope::parse(&json!({"type": kind, "object": object})).unwrap()
}
