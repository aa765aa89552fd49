use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TaskExecutor;
use crate::model::{Entity, Task};
use crate::registry::Registry;
use crate::scheduler::{ProbeError, Reconciler};

/// Watchdog hooks for tasks: the probe is the target component's health,
/// and a task confirmed `Running` is executed.
pub struct TaskReconciler {
    executor: Arc<TaskExecutor>,
}

impl TaskReconciler {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Reconciler for TaskReconciler {
    type Entity = Task;

    fn registry(&self) -> &dyn Registry<Task> {
        self.executor.tasks()
    }

    async fn probe(&self, task: &Task, cancel: &CancellationToken) -> Result<(), ProbeError> {
        let component = self.executor.components().get(&task.component_id).await?;
        let controller = self.executor.resources().get(&component.kind)?;
        debug!(task_id = %task.id, component_id = %component.id, "checking task component");
        controller.check_component(&component.metadata, cancel).await?;
        Ok(())
    }

    async fn on_running(&self, task: &Task, cancel: &CancellationToken) {
        if let Err(e) = self.executor.execute(task, cancel).await {
            warn!(task_id = %task.id(), error = %e, "scheduled task run failed");
        }
    }
}
