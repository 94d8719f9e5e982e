use std::time::Duration;

use trellis_core::JobKind;

use crate::backoff::BackoffPolicy;

/// Runtime configuration handed to the registry and the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace for replicas of custom resources that carry none.
    pub namespace: String,
    /// Kinds this deployment is willing to build.
    pub kinds: Vec<JobKind>,
    /// Backoff for stale-resource purge and cleanup convergence.
    pub purge: BackoffPolicy,
    /// Backoff between watch reconnects; its deadline is unused.
    pub reconnect: BackoffPolicy,
    /// Re-reconcile every tracked job at this interval.
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kinds: JobKind::ALL.to_vec(),
            purge: BackoffPolicy::default(),
            reconnect: BackoffPolicy {
                initial: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2,
                deadline: Duration::MAX,
            },
            resync_interval: Some(Duration::from_secs(60)),
        }
    }
}
