//! Cluster-orchestration controller.
//!
//! Placeholder for an apply/verify cycle against a cluster API: runs take a
//! configurable simulated delay and always succeed unless cancelled.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{cancellable, ControllerError, ResourceController, Result};
use crate::model::Metadata;

pub const DEFAULT_SIMULATED_DELAY: Duration = Duration::from_secs(1);

pub struct ClusterController {
    simulated_delay: Duration,
}

impl ClusterController {
    pub fn new(simulated_delay: Duration) -> Self {
        Self { simulated_delay }
    }

    async fn simulate(&self, cancel: &CancellationToken) -> Result<()> {
        cancellable(cancel, async {
            tokio::time::sleep(self.simulated_delay).await;
            Ok::<(), ControllerError>(())
        })
        .await
    }
}

impl Default for ClusterController {
    fn default() -> Self {
        Self::new(DEFAULT_SIMULATED_DELAY)
    }
}

#[async_trait]
impl ResourceController for ClusterController {
    fn validate_component(&self, _metadata: &Metadata) -> Result<()> {
        Ok(())
    }

    async fn check_component(&self, _metadata: &Metadata, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn validate_task(&self, _task_metadata: &Metadata) -> Result<()> {
        Ok(())
    }

    async fn run_task(
        &self,
        task_metadata: &Metadata,
        component_metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let task_id = task_metadata.get("id").map(String::as_str).unwrap_or("");
        let task_type = task_metadata.get("type").map(String::as_str).unwrap_or("");
        info!(
            task_id,
            task_type,
            component = ?component_metadata,
            "cluster controller applying task"
        );
        self.simulate(cancel).await?;
        info!(task_id, "cluster task completed");
        Ok(())
    }

    async fn rollback_task(
        &self,
        task_metadata: &Metadata,
        _component_metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let task_id = task_metadata.get("id").map(String::as_str).unwrap_or("");
        info!(task_id, "cluster controller rolling back task");
        self.simulate(cancel).await
    }
}
