//! Periodic reconciliation loop for one entity kind.
//!
//! Three independent timers (pending, running, failed) each snapshot the
//! registry, filter by status and hand the matching handler to the worker
//! pool. A zero interval disables that bucket.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::pool::{Submission, WorkerPool};
use super::reconcile::{BucketHandler, Reconciler};
use crate::model::{Entity, Status};

#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    pub pending_interval: Duration,
    pub running_interval: Duration,
    pub failed_interval: Duration,
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// Deadline for each probe and running hook; zero disables it.
    pub operation_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            pending_interval: Duration::from_secs(5),
            running_interval: Duration::from_secs(5),
            failed_interval: Duration::from_secs(5),
            max_workers: 8,
            queue_capacity: 256,
            operation_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Watchdog<R: Reconciler> {
    reconciler: Arc<R>,
    options: WatchdogOptions,
}

impl<R: Reconciler> Watchdog<R> {
    pub fn new(reconciler: Arc<R>, options: WatchdogOptions) -> Self {
        Self {
            reconciler,
            options,
        }
    }

    /// Run until `cancel` fires, then drain in-flight handlers.
    pub async fn run(self, cancel: CancellationToken) {
        let kind = <R::Entity as Entity>::KIND;
        let opts = &self.options;
        let pool = WorkerPool::new(kind, opts.max_workers, opts.queue_capacity);

        let mut pending = ticker(opts.pending_interval);
        let mut running = ticker(opts.running_interval);
        let mut failed = ticker(opts.failed_interval);

        info!(
            kind,
            pending = ?opts.pending_interval,
            running = ?opts.running_interval,
            failed = ?opts.failed_interval,
            workers = opts.max_workers,
            "watchdog started"
        );

        loop {
            let status = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick(&mut pending) => Status::Pending,
                _ = tick(&mut running) => Status::Running,
                _ = tick(&mut failed) => Status::Failed,
            };
            self.dispatch(&pool, status, &cancel).await;
        }

        info!(kind, in_flight = pool.in_flight(), "watchdog stopping, draining workers");
        pool.shutdown(self.options.drain_timeout).await;
    }

    async fn dispatch(&self, pool: &WorkerPool, status: Status, cancel: &CancellationToken) {
        let kind = <R::Entity as Entity>::KIND;
        let Some(handler) = BucketHandler::for_status(status) else {
            return;
        };

        let entities = match self.reconciler.registry().list().await {
            Ok(entities) => entities,
            Err(e) => {
                error!(kind, %status, error = %e, "failed to list entities");
                return;
            }
        };

        let mut queued = 0usize;
        for entity in entities
            .into_iter()
            .filter(|e| e.is_enabled() && e.last_status() == status)
        {
            let id = entity.id().to_string();
            let reconciler = self.reconciler.clone();
            let cancel = cancel.clone();
            let timeout = self.options.operation_timeout;
            let job =
                async move { handler.run(reconciler.as_ref(), entity, timeout, &cancel).await }.boxed();

            match pool.submit(id, job) {
                Submission::Queued => queued += 1,
                Submission::Duplicate | Submission::Full => {}
                Submission::Closed => return,
            }
        }
        if queued > 0 {
            debug!(kind, %status, queued, "dispatched handlers");
        }
    }
}

/// First tick one period from now. `None` for a disabled bucket.
fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
