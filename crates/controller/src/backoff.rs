//! Bounded exponential backoff and the "wait until nothing is left" loop built on it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use trellis_core::ClusterError;

use crate::error::{ConvergenceTimeout, JobError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Overall budget for one convergence wait.
    pub deadline: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
            deadline: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Poll `probe` until it reports zero, sleeping with backoff in between.
    pub async fn wait_until_empty<F, Fut>(&self, what: &str, mut probe: F) -> Result<(), JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<usize, ClusterError>>,
    {
        let started = Instant::now();
        let mut backoff = Backoff::new(self.clone());
        loop {
            let remaining = probe().await?;
            if remaining == 0 {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                return Err(ConvergenceTimeout { what: what.to_string(), remaining, elapsed }.into());
            }
            let delay = backoff.next_delay().min(self.deadline - elapsed);
            debug!(what, remaining, delay_ms = delay.as_millis() as u64, "waiting for deletion to converge");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Stateful delay sequence: `initial`, `initial * m`, ... capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let next = policy.initial;
        Self { policy, next }
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = (current * self.policy.multiplier.max(1)).min(self.policy.max_delay);
        current
    }

    pub fn reset(&mut self) { self.next = self.policy.initial; }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy() -> BackoffPolicy {
        BackoffPolicy { initial: Duration::from_millis(10), max_delay: Duration::from_millis(40), multiplier: 2, deadline: Duration::from_millis(200) }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut b = Backoff::new(policy());
        let seq: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(seq, vec![10, 20, 40, 40, 40]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn converges_once_probe_reports_zero() {
        let left = Cell::new(3usize);
        let res = policy()
            .wait_until_empty("pods", || {
                let n = left.get();
                left.set(n.saturating_sub(1));
                async move { Ok(n) }
            })
            .await;
        assert!(res.is_ok());
        assert_eq!(left.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_deadline() {
        let err = policy().wait_until_empty("pods of job x", || async { Ok(2) }).await.unwrap_err();
        match err {
            JobError::Convergence(t) => {
                assert_eq!(t.what, "pods of job x");
                assert_eq!(t.remaining, 2);
                assert!(t.elapsed >= Duration::from_millis(200));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_errors_propagate() {
        let err = policy().wait_until_empty("pods", || async { Err(ClusterError::Api("boom".into())) }).await.unwrap_err();
        assert_eq!(err, JobError::Cluster(ClusterError::Api("boom".into())));
    }
}
