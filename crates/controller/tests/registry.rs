#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;

use common::{ps_spec, pw_spec, registry};
use trellis_controller::{ApplyOutcome, ConfigError, CreateOutcome, JobError, JobKey, KindRegistry};
use trellis_core::{render::replica_labels, JobKind, MemoryCluster, ReplicaError, ReplicaStatus, SpecValidationError};

#[tokio::test]
async fn create_builds_and_reconciles_every_replica() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);
    let outcome = reg.create("mnist", None, "MXJob", &ps_spec(1, 2, 3)).await.unwrap();
    assert_eq!(outcome, CreateOutcome::Created);
    assert_eq!(cluster.pod_names("ml").len(), 6);
    assert_eq!(cluster.service_names("ml").len(), 6);
    let job = reg.get("mnist", None).unwrap();
    assert_eq!(job.kind(), JobKind::ParameterServer);
    assert!(job.replicas().iter().all(|r| r.status() == ReplicaStatus::Present));
}

#[tokio::test]
async fn duplicate_creation_event_is_a_no_op() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);
    reg.create("dist", Some("team-a"), "TFJob", &pw_spec(1, 2)).await.unwrap();
    let before = cluster.stats();
    let outcome = reg.create("dist", Some("team-a"), "TFJob", &pw_spec(4, 4)).await.unwrap();
    assert_eq!(outcome, CreateOutcome::AlreadyPresent);
    assert_eq!(cluster.stats(), before);
    assert_eq!(reg.get("dist", None).unwrap().replicas().len(), 3);
    assert_eq!(cluster.pod_names("team-a").len(), 3);
}

#[tokio::test]
async fn rejected_specs_leave_registry_and_cluster_untouched() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);

    let err = reg.create("x", None, "PyTorchJob", &pw_spec(1, 1)).await.unwrap_err();
    assert_eq!(err, JobError::Spec(SpecValidationError::UnknownKind("PyTorchJob".into())));

    let err = reg.create("x", None, "TFJob", &ps_spec(1, 1, 1)).await.unwrap_err();
    assert!(matches!(err, JobError::Spec(SpecValidationError::ReplicaTypeNotAllowed { .. })));

    assert!(reg.is_empty());
    assert_eq!(cluster.stats().lists, 0);
}

#[tokio::test]
async fn disabled_kinds_are_refused() {
    let cluster = Arc::new(MemoryCluster::new());
    let cfg = common::config();
    let kinds = KindRegistry::from_names(&["TFJob"]).unwrap();
    let mut reg = trellis_controller::JobRegistry::new(cluster.clone(), kinds, &cfg);
    let err = reg.create("mnist", None, "MXJob", &ps_spec(1, 1, 1)).await.unwrap_err();
    assert_eq!(err, JobError::Spec(SpecValidationError::KindDisabled(JobKind::ParameterServer)));
    assert!(reg.is_empty());
}

#[test]
fn kind_registry_is_validated_at_startup() {
    assert_eq!(KindRegistry::from_names::<&str>(&[]).unwrap_err(), ConfigError::NoKinds);
    assert!(matches!(KindRegistry::from_names(&["TFJob", "Nope"]), Err(ConfigError::Kind(SpecValidationError::UnknownKind(_)))));
    let reg = KindRegistry::from_names(&["tfjob", "TFJob", "MXJob"]).unwrap();
    assert_eq!(reg.enabled(), &[JobKind::ParameterWorker, JobKind::ParameterServer]);
}

#[tokio::test]
async fn stale_resources_are_purged_before_creation() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert_pod("ml", "worker-dist-0", replica_labels("dist", "worker-dist-0"));
    cluster.insert_pod("ml", "chief-dist-0", replica_labels("dist", "chief-dist-0"));
    cluster.insert_pod("ml", "worker-other-0", replica_labels("other", "worker-other-0"));
    let mut reg = registry(&cluster);
    reg.create("dist", None, "TFJob", &pw_spec(1, 1)).await.unwrap();
    let pods = cluster.pod_names("ml");
    assert_eq!(pods, vec!["ps-dist-0", "worker-dist-0", "worker-other-0"]);
    // the stale worker pod was deleted and recreated, not adopted
    assert_eq!(cluster.stats().pod_deletes, 2);
    assert_eq!(cluster.stats().pod_creates, 2);
}

#[tokio::test]
async fn purge_that_never_converges_times_out_and_registers_nothing() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert_pod("ml", "worker-dist-0", replica_labels("dist", "worker-dist-0"));
    cluster.set_stall_deletes(true);
    let mut reg = registry(&cluster);
    let err = reg.create("dist", None, "TFJob", &pw_spec(1, 1)).await.unwrap_err();
    match err {
        JobError::Convergence(t) => assert_eq!(t.remaining, 1),
        other => panic!("expected convergence timeout, got {other:?}"),
    }
    assert!(!reg.contains("dist", None));
    assert_eq!(cluster.stats().pod_creates, 0);
}

#[tokio::test]
async fn failed_creates_keep_the_job_for_a_later_resync() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.set_fail_creates(true);
    let mut reg = registry(&cluster);
    let err = reg.create("dist", None, "TFJob", &pw_spec(1, 2)).await.unwrap_err();
    assert_eq!(err.failures().len(), 3);
    assert!(reg.contains("dist", None));
    assert!(cluster.pod_names("ml").is_empty());

    cluster.set_fail_creates(false);
    assert_eq!(reg.resync().await, 0);
    assert_eq!(cluster.pod_names("ml"), vec!["ps-dist-0", "worker-dist-0", "worker-dist-1"]);
}

#[tokio::test]
async fn invariant_violation_on_one_replica_does_not_block_the_rest() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);
    reg.create("dist", None, "TFJob", &pw_spec(1, 2)).await.unwrap();
    for name in ["ps-dist-0", "worker-dist-0", "worker-dist-1"] {
        assert!(cluster.evict_pod("ml", name));
    }
    cluster.insert_pod("ml", "dup-a", replica_labels("dist", "worker-dist-0"));
    cluster.insert_pod("ml", "dup-b", replica_labels("dist", "worker-dist-0"));
    let before = cluster.stats();

    assert_eq!(reg.resync().await, 1);
    let err = reg.apply("dist", None, "TFJob", &pw_spec(1, 2)).await.unwrap_err();
    let failures = err.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].replica, "worker-dist-0");
    assert!(matches!(failures[0].error, ReplicaError::InvariantViolation { count: 2, .. }));

    // vanished pods of present replicas are reported, not recreated, and nothing is deleted
    let after = cluster.stats();
    assert_eq!(after.pod_creates, before.pod_creates);
    assert_eq!(after.pod_deletes, before.pod_deletes);
    assert_eq!(cluster.pod_names("ml"), vec!["dup-a", "dup-b"]);
}

#[tokio::test]
async fn remove_cleans_up_before_forgetting_and_is_idempotent() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);
    reg.create("mnist", None, "MXJob", &ps_spec(1, 1, 2)).await.unwrap();
    assert!(reg.remove("mnist", None).await.unwrap());
    assert!(cluster.pod_names("ml").is_empty());
    assert!(cluster.service_names("ml").is_empty());
    assert!(!reg.contains("mnist", None));
    assert!(!reg.remove("mnist", None).await.unwrap());
}

#[tokio::test]
async fn stalled_deletion_keeps_the_job_until_resync_finishes_cleanup() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);
    reg.create("dist", None, "TFJob", &pw_spec(1, 1)).await.unwrap();
    cluster.set_stall_deletes(true);

    let err = reg.remove("dist", None).await.unwrap_err();
    assert!(matches!(err, JobError::Convergence(_)));
    assert!(reg.contains("dist", None));
    assert!(reg.is_deleting("dist", None));
    assert_eq!(cluster.pod_names("ml").len(), 2);

    // still stalled: the retry fails and the job stays
    assert_eq!(reg.resync().await, 1);
    assert!(reg.is_deleting("dist", None));

    cluster.set_stall_deletes(false);
    assert_eq!(reg.resync().await, 0);
    assert!(reg.is_empty());
    assert!(cluster.pod_names("ml").is_empty());
    assert!(cluster.service_names("ml").is_empty());
}

#[tokio::test]
async fn recreating_a_job_under_deletion_takes_it_over() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);
    reg.create("dist", None, "TFJob", &pw_spec(1, 1)).await.unwrap();
    cluster.set_stall_deletes(true);
    reg.remove("dist", None).await.unwrap_err();
    cluster.set_stall_deletes(false);

    assert_eq!(reg.create("dist", None, "TFJob", &pw_spec(1, 2)).await.unwrap(), CreateOutcome::Created);
    assert!(!reg.is_deleting("dist", None));
    assert_eq!(reg.get("dist", None).unwrap().replicas().len(), 3);
    assert_eq!(cluster.pod_names("ml"), vec!["ps-dist-0", "worker-dist-0", "worker-dist-1"]);
}

#[tokio::test]
async fn same_name_in_two_namespaces_are_separate_jobs() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);
    assert_eq!(reg.create("dist", Some("team-a"), "TFJob", &pw_spec(1, 1)).await.unwrap(), CreateOutcome::Created);
    assert_eq!(reg.create("dist", Some("team-b"), "TFJob", &pw_spec(1, 1)).await.unwrap(), CreateOutcome::Created);
    assert_eq!(reg.keys(), vec![JobKey::new("team-a", "dist"), JobKey::new("team-b", "dist")]);
    assert!(!reg.contains("dist", None));

    assert!(reg.remove("dist", Some("team-b")).await.unwrap());
    assert!(cluster.pod_names("team-b").is_empty());
    assert_eq!(cluster.pod_names("team-a"), vec!["ps-dist-0", "worker-dist-0"]);
    assert!(reg.contains("dist", Some("team-a")));
}

#[tokio::test]
async fn job_cleanup_twice_does_not_error() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut job = trellis_controller::Job::new("dist", "ml", JobKind::ParameterWorker, &pw_spec(1, 1), common::config().purge).unwrap();
    job.reconcile(cluster.as_ref()).await.unwrap();
    job.cleanup(cluster.as_ref()).await.unwrap();
    job.cleanup(cluster.as_ref()).await.unwrap();
    assert!(job.replicas().iter().all(|r| r.status() == ReplicaStatus::Deleted));
    assert_eq!(cluster.stats().pod_deletes, 2);
}

#[tokio::test]
async fn modified_events_resync_or_replace() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);

    assert_eq!(reg.apply("dist", None, "TFJob", &pw_spec(1, 1)).await.unwrap(), ApplyOutcome::Created);
    assert_eq!(reg.apply("dist", None, "TFJob", &pw_spec(1, 1)).await.unwrap(), ApplyOutcome::Resynced);
    assert_eq!(cluster.stats().pod_creates, 2);

    assert_eq!(reg.apply("dist", None, "TFJob", &pw_spec(1, 3)).await.unwrap(), ApplyOutcome::Replaced);
    assert_eq!(reg.get("dist", None).unwrap().replicas().len(), 4);
    assert_eq!(cluster.pod_names("ml"), vec!["ps-dist-0", "worker-dist-0", "worker-dist-1", "worker-dist-2"]);

    // an invalid replacement keeps the running job
    let err = reg.apply("dist", None, "TFJob", &ps_spec(1, 1, 1)).await.unwrap_err();
    assert!(matches!(err, JobError::Spec(_)));
    assert_eq!(reg.get("dist", None).unwrap().replicas().len(), 4);
    assert_eq!(cluster.pod_names("ml").len(), 4);
}

#[tokio::test]
async fn cleanup_all_empties_registry_and_cluster() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut reg = registry(&cluster);
    reg.create("a", None, "TFJob", &pw_spec(1, 1)).await.unwrap();
    reg.create("b", None, "MXJob", &ps_spec(1, 1, 1)).await.unwrap();
    assert_eq!(reg.keys(), vec![JobKey::new("ml", "a"), JobKey::new("ml", "b")]);
    reg.cleanup_all().await;
    assert!(reg.is_empty());
    assert!(cluster.pod_names("ml").is_empty());
    assert!(cluster.service_names("ml").is_empty());
}
