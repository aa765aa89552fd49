use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use super::TaskError;
use crate::model::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Task,
    Plan,
    Rollback,
}

/// State of one asynchronous run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub kind: RunKind,
    pub target_id: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Spawns runs in the background and keeps their records.
pub struct RunTracker {
    runs: Arc<RwLock<HashMap<String, RunRecord>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl RunTracker {
    /// Runs observe `cancel`, normally the daemon's root token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Start `work` in the background and return its run id.
    pub async fn spawn<F, Fut>(&self, kind: RunKind, target_id: &str, work: F) -> String
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let run_id = Uuid::new_v4().to_string();
        let record = RunRecord {
            id: run_id.clone(),
            kind,
            target_id: target_id.to_string(),
            status: Status::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        self.runs.write().await.insert(run_id.clone(), record);
        info!(run_id = %run_id, ?kind, target_id, "run started");

        let fut = work(self.cancel.child_token());
        let runs = self.runs.clone();
        let id = run_id.clone();
        self.tracker.spawn(async move {
            let outcome = fut.await;
            let mut runs = runs.write().await;
            if let Some(record) = runs.get_mut(&id) {
                record.finished_at = Some(Utc::now());
                match outcome {
                    Ok(()) => record.status = Status::Success,
                    Err(e) => {
                        warn!(run_id = %id, error = %e, "run failed");
                        record.status = Status::Failed;
                        record.error = Some(e.to_string());
                    }
                }
            }
        });

        run_id
    }

    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// All runs, newest first.
    pub async fn list(&self) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    /// Wait up to `timeout` for outstanding runs.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }
}
