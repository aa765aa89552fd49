//! Fixed-size worker pool fed by a bounded queue.
//!
//! Jobs are keyed by entity id. A key that is already queued or running is
//! not accepted again until its job finishes, so overlapping ticks cannot
//! stack work for the same entity. Deadlines are the job's concern; a job
//! that panics is logged and its key released.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Outcome of [`WorkerPool::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// Same key is already queued or in flight.
    Duplicate,
    /// Queue is at capacity; retried on a later tick.
    Full,
    Closed,
}

struct Work {
    key: String,
    job: BoxFuture<'static, ()>,
}

type InFlight = Arc<Mutex<HashSet<String>>>;

pub struct WorkerPool {
    name: &'static str,
    sender: mpsc::Sender<Work>,
    in_flight: InFlight,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Spawn `workers` workers.
    pub fn new(name: &'static str, workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Work>(queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let tracker = TaskTracker::new();

        for worker in 0..workers.max(1) {
            let receiver = receiver.clone();
            let in_flight = in_flight.clone();
            tracker.spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(Work { key, job }) = next else {
                        break;
                    };
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!(pool = name, worker, id = %key, "job panicked");
                    }
                    release(&in_flight, &key);
                }
                debug!(pool = name, worker, "worker stopped");
            });
        }

        Self {
            name,
            sender,
            in_flight,
            tracker,
        }
    }

    /// Enqueue `job` under `key` without waiting.
    pub fn submit(&self, key: impl Into<String>, job: BoxFuture<'static, ()>) -> Submission {
        let key = key.into();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(key.clone()) {
                return Submission::Duplicate;
            }
        }

        match self.sender.try_send(Work {
            key: key.clone(),
            job,
        }) {
            Ok(()) => Submission::Queued,
            Err(e) => {
                release(&self.in_flight, &key);
                match e {
                    TrySendError::Full(_) => {
                        warn!(pool = self.name, id = %key, "work queue full, deferring to next tick");
                        Submission::Full
                    }
                    TrySendError::Closed(_) => Submission::Closed,
                }
            }
        }
    }

    /// Number of keys queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop accepting work and wait up to `drain_timeout` for queued and
    /// running jobs. Returns `false` if the deadline passed first.
    pub async fn shutdown(self, drain_timeout: Duration) -> bool {
        let Self {
            name,
            sender,
            tracker,
            ..
        } = self;
        drop(sender);
        tracker.close();

        match tokio::time::timeout(drain_timeout, tracker.wait()).await {
            Ok(()) => {
                debug!(pool = name, "worker pool drained");
                true
            }
            Err(_) => {
                warn!(pool = name, timeout = ?drain_timeout, "worker pool drain timed out");
                false
            }
        }
    }
}

fn release(in_flight: &InFlight, key: &str) {
    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key);
}
