//! Trellis controller: turns custom-resource events into reconciled training jobs.
//!
//! The [`ControlLoop`] reads a resumable event stream and drives a [`JobRegistry`];
//! each [`Job`] owns the replicas expanded from its spec and talks to the cluster
//! only through the [`trellis_core::Cluster`] seam.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod control;
pub mod error;
pub mod job;
pub mod registry;

pub use backoff::{Backoff, BackoffPolicy};
pub use config::ControllerConfig;
pub use control::ControlLoop;
pub use error::{ConfigError, ConvergenceTimeout, JobError, ReplicaFailure};
pub use job::Job;
pub use registry::{ApplyOutcome, CreateOutcome, JobKey, JobRegistry, KindRegistry};
