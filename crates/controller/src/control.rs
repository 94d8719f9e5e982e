//! Watch-driven control loop.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use trellis_core::{EventSource, EventType, WatchCursor, WatchEnvelope, WatchStreamError};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::ControllerConfig;
use crate::registry::{ApplyOutcome, CreateOutcome, JobRegistry};

/// Consumes the event source sequentially and drives the registry.
///
/// Events are handled one at a time and run to completion; shutdown is only
/// observed between events. Every tracked job is cleaned up before `run` returns.
pub struct ControlLoop<S> {
    source: S,
    registry: JobRegistry,
    cursor: WatchCursor,
    reconnect: BackoffPolicy,
    resync_interval: Option<Duration>,
}

impl<S: EventSource> ControlLoop<S> {
    pub fn new(source: S, registry: JobRegistry, config: &ControllerConfig) -> Self {
        Self {
            source,
            registry,
            cursor: WatchCursor::beginning(),
            reconnect: config.reconnect.clone(),
            resync_interval: config.resync_interval.filter(|d| !d.is_zero()),
        }
    }

    pub fn cursor(&self) -> &WatchCursor { &self.cursor }
    pub fn registry(&self) -> &JobRegistry { &self.registry }
    pub fn source(&self) -> &S { &self.source }

    /// Run until `shutdown` resolves, then clean up every tracked job.
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) {
        tokio::pin!(shutdown);
        let mut reconnect = Backoff::new(self.reconnect.clone());
        let mut resync = self.resync_interval.map(|every| {
            let mut i = tokio::time::interval_at(Instant::now() + every, every);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });

        'watch: loop {
            let opened = tokio::select! {
                _ = &mut shutdown => break 'watch,
                opened = self.source.watch(&self.cursor) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    self.on_stream_error(&e);
                    let delay = reconnect.next_delay();
                    tokio::select! {
                        _ = &mut shutdown => break 'watch,
                        _ = tokio::time::sleep(delay) => continue 'watch,
                    }
                }
            };
            debug!(cursor = ?self.cursor.resource_version(), "watch opened");

            loop {
                tokio::select! {
                    _ = &mut shutdown => break 'watch,
                    _ = tick(&mut resync) => {
                        self.registry.resync().await;
                    }
                    item = stream.next() => match item {
                        Some(Ok(envelope)) => {
                            reconnect.reset();
                            self.handle(envelope).await;
                        }
                        Some(Err(WatchStreamError::Decode(msg))) => {
                            warn!(error = %msg, "skipping undecodable watch event");
                        }
                        Some(Err(e)) => {
                            self.on_stream_error(&e);
                            let delay = reconnect.next_delay();
                            tokio::select! {
                                _ = &mut shutdown => break 'watch,
                                _ = tokio::time::sleep(delay) => continue 'watch,
                            }
                        }
                        None => {
                            counter!("watch_restarts_total", 1u64);
                            let delay = reconnect.next_delay();
                            debug!(?delay, "watch stream ended; resuming from cursor");
                            tokio::select! {
                                _ = &mut shutdown => break 'watch,
                                _ = tokio::time::sleep(delay) => continue 'watch,
                            }
                        }
                    }
                }
            }
        }

        info!(jobs = self.registry.len(), "control loop stopping; cleaning up tracked jobs");
        self.registry.cleanup_all().await;
    }

    fn on_stream_error(&mut self, e: &WatchStreamError) {
        counter!("watch_restarts_total", 1u64);
        match e {
            WatchStreamError::Expired => {
                warn!(cursor = ?self.cursor.resource_version(), "watch cursor expired; restarting from the beginning");
                counter!("watch_cursor_expired_total", 1u64);
                self.cursor.reset();
            }
            other => warn!(error = %other, "watch interrupted; reconnecting"),
        }
    }

    /// Dispatch one event and advance the cursor past it.
    pub async fn handle(&mut self, envelope: WatchEnvelope) {
        self.dispatch(&envelope).await;
        if let Some(rv) = envelope.resource_version() {
            self.cursor.advance(rv);
        }
    }

    async fn dispatch(&mut self, envelope: &WatchEnvelope) {
        if envelope.event_type == EventType::Bookmark {
            return;
        }
        let Some(name) = envelope.name() else {
            warn!(event = ?envelope.event_type, "event without a name; skipping");
            return;
        };
        let ns = envelope.namespace();
        let kind = envelope.object.kind.as_str();
        info!(event = ?envelope.event_type, job = %name, ns = ?ns, kind, "handling event");
        match (envelope.event_type, envelope.object.spec.as_ref()) {
            (EventType::Deleted, _) => match self.registry.remove(name, ns).await {
                Ok(true) => info!(job = %name, "job deleted"),
                Ok(false) => debug!(job = %name, "deletion of untracked job"),
                Err(e) => error!(job = %name, error = %e, "job cleanup incomplete; retrying on resync"),
            },
            (_, None) => debug!(job = %name, "object has no spec; skipping"),
            (EventType::Added, Some(spec)) => match self.registry.create(name, ns, kind, spec).await {
                Ok(CreateOutcome::Created) => {}
                Ok(CreateOutcome::AlreadyPresent) => debug!(job = %name, "duplicate creation event"),
                Err(e) => error!(job = %name, error = %e, "job creation failed"),
            },
            (EventType::Modified, Some(spec)) => match self.registry.apply(name, ns, kind, spec).await {
                Ok(ApplyOutcome::Replaced) => info!(job = %name, "job replaced with new spec"),
                Ok(outcome) => debug!(job = %name, ?outcome, "modification handled"),
                Err(e) => error!(job = %name, error = %e, "job update failed"),
            },
            (EventType::Bookmark, _) => {}
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
