#![forbid(unsafe_code)]

mod common;

use common::{entry, ps_spec, pw_spec};
use serde_json::json;
use trellis_controller::{BackoffPolicy, Job};
use trellis_core::{JobKind, Role, SpecValidationError};

#[test]
fn parameter_server_job_expands_six_replicas() {
    let job = Job::new("mnist", "ml", JobKind::ParameterServer, &ps_spec(1, 2, 3), BackoffPolicy::default()).unwrap();
    let names: Vec<&str> = job.replicas().iter().map(|r| r.name()).collect();
    assert_eq!(
        names,
        vec!["scheduler-mnist-0", "server-mnist-0", "server-mnist-1", "worker-mnist-0", "worker-mnist-1", "worker-mnist-2"]
    );
    for r in job.replicas() {
        assert_eq!(r.env_value("DMLC_NUM_SERVER"), Some("2"));
        assert_eq!(r.env_value("DMLC_NUM_WORKER"), Some("3"));
        assert_eq!(r.env_value("DMLC_PS_ROOT_URI"), Some("scheduler-mnist-0"));
        assert_eq!(r.env_value("DMLC_PS_ROOT_PORT"), Some("9000"));
        assert_eq!(r.env_value("DMLC_ROLE"), Some(r.role().as_str()));
        assert_eq!(r.env_value("PS_VERBOSE"), Some("2"));
        assert_eq!(r.params().ports.as_slice(), &[9000]);
    }
}

#[test]
fn parameter_worker_job_shares_one_cluster_map() {
    let job = Job::new("dist", "ml", JobKind::ParameterWorker, &pw_spec(1, 2), BackoffPolicy::default()).unwrap();
    let worker1 = job.replica("worker-dist-1").unwrap();
    assert_eq!(
        worker1.env_value("TF_CONFIG"),
        Some(r#"{"cluster":{"ps":["ps0.2222"],"worker":["worker0.2222","worker1.2222"]},"task":{"type":"worker","index":1}}"#)
    );

    let clusters: Vec<serde_json::Value> = job
        .replicas()
        .iter()
        .map(|r| {
            let cfg: serde_json::Value = serde_json::from_str(r.env_value("TF_CONFIG").unwrap()).unwrap();
            assert_eq!(cfg["task"]["type"], r.role().as_str());
            assert_eq!(cfg["task"]["index"], r.uid());
            cfg["cluster"].clone()
        })
        .collect();
    assert_eq!(clusters.len(), 3);
    assert!(clusters.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn counts_are_resolved_before_any_environment() {
    // workers are declared before the ps group, yet every replica sees both counts
    let spec = json!([entry("worker", 2), entry("ps", 3)]);
    let job = Job::new("late", "ml", JobKind::ParameterWorker, &spec, BackoffPolicy::default()).unwrap();
    let first = job.replicas().first().unwrap();
    assert_eq!(first.role(), Role::Worker);
    let cfg: serde_json::Value = serde_json::from_str(first.env_value("TF_CONFIG").unwrap()).unwrap();
    assert_eq!(cfg["cluster"]["ps"], json!(["ps0.2222", "ps1.2222", "ps2.2222"]));
}

#[test]
fn invalid_specs_never_produce_a_job() {
    let err = Job::new("bad", "ml", JobKind::ParameterServer, &pw_spec(1, 1), BackoffPolicy::default()).err().unwrap();
    assert!(matches!(err, SpecValidationError::ReplicaTypeNotAllowed { ref replica_type, .. } if replica_type == "ps"));

    let err = Job::new("bad", "ml", JobKind::ParameterWorker, &json!([]), BackoffPolicy::default()).err().unwrap();
    assert_eq!(err, SpecValidationError::EmptySpec);
}

#[test]
fn pods_carry_selector_labels_and_env() {
    let job = Job::new("dist", "ml", JobKind::ParameterWorker, &pw_spec(1, 1), BackoffPolicy::default()).unwrap();
    let ps = job.replica("ps-dist-0").unwrap();
    let labels = ps.pod().metadata.labels.clone().unwrap();
    assert_eq!(labels["job_name"], "dist");
    assert_eq!(labels["pod_name"], "ps-dist-0");
    let container = &ps.pod().spec.as_ref().unwrap().containers[0];
    let env = container.env.as_ref().unwrap();
    assert_eq!(env[0].name, "TF_CONFIG");
    assert_eq!(ps.service().unwrap().metadata.name.as_deref(), Some("ps-dist-0"));
}
