//! # Controller Runtime
//!
//! Bounded worker pool driving the engine from the work queue. An event pump
//! feeds [`ResourceEvent`]s into the queue; each worker runs
//! `dequeue -> reconcile -> requeue/forget -> mark_done` until shutdown.

use crate::engine::{Engine, ReconcileOutcome};
use crate::error::ConfigError;
use crate::queue::{EnqueueReason, WorkItem, WorkQueue};
use crate::types::{Condition, ResourceEvent};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Upper bound for a single pass
    pub pass_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            pass_timeout: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }
        if self.pass_timeout.is_zero() {
            return Err(ConfigError::invalid("pass_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Counters updated by the workers
#[derive(Debug, Default)]
pub struct ControllerStats {
    events: AtomicU64,
    passes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    panics: AtomicU64,
    ready: AtomicU64,
    progressing: AtomicU64,
    degraded: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`] plus queue gauges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events: u64,
    pub passes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub panics: u64,
    pub ready: u64,
    pub progressing: u64,
    pub degraded: u64,
    /// Identities whose last reported condition is Degraded
    pub degraded_identities: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub scheduled_requeues: usize,
}

impl ControllerStats {
    fn record_outcome(&self, outcome: &ReconcileOutcome) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome.condition() {
            Some(Condition::Ready) => &self.ready,
            Some(Condition::Progressing) => &self.progressing,
            Some(Condition::Degraded) => &self.degraded,
            None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue: &WorkQueue) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            ready: self.ready.load(Ordering::Relaxed),
            progressing: self.progressing.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            degraded_identities: 0,
            queue_depth: queue.len(),
            in_flight: queue.in_flight(),
            scheduled_requeues: queue.scheduled(),
        }
    }
}

/// Owns the queue, the engine and the worker pool
pub struct Controller {
    engine: Arc<Engine>,
    queue: Arc<WorkQueue>,
    stats: Arc<ControllerStats>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(engine: Arc<Engine>, config: ControllerConfig) -> Self {
        Self {
            engine,
            queue: Arc::new(WorkQueue::new()),
            stats: Arc::new(ControllerStats::default()),
            config,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    pub fn engine(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            degraded_identities: self.engine.degraded_identities(),
            ..self.stats.snapshot(&self.queue)
        }
    }

    /// Process events until `shutdown` resolves, then let in-flight passes
    /// finish and return
    pub async fn run<S>(&self, events: mpsc::Receiver<ResourceEvent>, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        info!(
            concurrency = self.config.concurrency,
            pass_timeout_ms = self.config.pass_timeout.as_millis() as u64,
            "controller starting"
        );

        let pump = tokio::spawn(pump_events(
            events,
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
        ));

        let workers: Vec<JoinHandle<()>> = (0..self.config.concurrency.max(1))
            .map(|worker| {
                let worker = Worker {
                    id: worker,
                    engine: Arc::clone(&self.engine),
                    queue: Arc::clone(&self.queue),
                    stats: Arc::clone(&self.stats),
                    pass_timeout: self.config.pass_timeout,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        shutdown.await;
        info!(in_flight = self.queue.in_flight(), "controller shutting down");
        self.queue.shutdown();
        pump.abort();

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("controller stopped");
    }
}

async fn pump_events(
    mut events: mpsc::Receiver<ResourceEvent>,
    queue: Arc<WorkQueue>,
    stats: Arc<ControllerStats>,
) {
    while let Some(event) = events.recv().await {
        stats.events.fetch_add(1, Ordering::Relaxed);
        debug!(identity = %event.identity, kind = ?event.kind, "event received");
        queue.enqueue(event.identity, EnqueueReason::Event(event.kind));
    }
    debug!("event channel closed");
}

struct Worker {
    id: usize,
    engine: Arc<Engine>,
    queue: Arc<WorkQueue>,
    stats: Arc<ControllerStats>,
    pass_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");
        while let Some(item) = self.queue.dequeue().await {
            self.process(&item).await;
            self.queue.mark_done(&item.identity);
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, item: &WorkItem) {
        let identity = &item.identity;
        debug!(
            worker = self.id,
            identity = %identity,
            reason = ?item.reason,
            requeues = item.requeue_count,
            "processing"
        );

        let pass = AssertUnwindSafe(self.engine.reconcile(identity)).catch_unwind();
        let requeue_after = match tokio::time::timeout(self.pass_timeout, pass).await {
            Ok(Ok(outcome)) => {
                self.stats.record_outcome(&outcome);
                outcome.requeue_after
            }
            Ok(Err(_panic)) => {
                self.stats.panics.fetch_add(1, Ordering::Relaxed);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                let delay = self.engine.record_failure(identity);
                error!(identity = %identity, delay_ms = delay.as_millis() as u64, "reconcile panicked");
                Some(delay)
            }
            Err(_elapsed) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                let delay = self.engine.record_failure(identity);
                warn!(
                    identity = %identity,
                    timeout_ms = self.pass_timeout.as_millis() as u64,
                    delay_ms = delay.as_millis() as u64,
                    "reconcile timed out"
                );
                Some(delay)
            }
        };

        match requeue_after {
            Some(after) => self.queue.requeue(identity, after),
            None => self.queue.forget(identity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_config_validation() {
        assert!(ControllerConfig::default().validate().is_ok());

        let no_workers = ControllerConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            no_workers.validate(),
            Err(ConfigError::Invalid { field: "concurrency", .. })
        ));

        let no_timeout = ControllerConfig {
            pass_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn test_stats_snapshot_starts_empty() {
        let stats = ControllerStats::default();
        let queue = WorkQueue::new();
        assert_eq!(stats.snapshot(&queue), StatsSnapshot::default());
    }
}
