use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Result, TaskError};
use crate::controller::{MonitorControllers, ResourceControllers};
use crate::model::{Component, Entity, Monitoring, Plan, Status, Task};
use crate::registry::{advance_status, record_event, record_transition, Registry};

/// Runs tasks against their component's resource controller, resolving
/// dependencies depth-first in declaration order.
pub struct TaskExecutor {
    tasks: Arc<dyn Registry<Task>>,
    components: Arc<dyn Registry<Component>>,
    monitorings: Arc<dyn Registry<Monitoring>>,
    plans: Arc<dyn Registry<Plan>>,
    resources: Arc<ResourceControllers>,
    monitors: Arc<MonitorControllers>,
    // Serializes the final status write of whichever task is finishing.
    finalize_lock: Mutex<()>,
}

impl TaskExecutor {
    pub fn new(
        tasks: Arc<dyn Registry<Task>>,
        components: Arc<dyn Registry<Component>>,
        monitorings: Arc<dyn Registry<Monitoring>>,
        plans: Arc<dyn Registry<Plan>>,
        resources: Arc<ResourceControllers>,
        monitors: Arc<MonitorControllers>,
    ) -> Self {
        Self {
            tasks,
            components,
            monitorings,
            plans,
            resources,
            monitors,
            finalize_lock: Mutex::new(()),
        }
    }

    pub fn tasks(&self) -> &dyn Registry<Task> {
        self.tasks.as_ref()
    }

    pub fn components(&self) -> &dyn Registry<Component> {
        self.components.as_ref()
    }

    pub fn resources(&self) -> &ResourceControllers {
        &self.resources
    }

    /// Execute `task` and everything it depends on.
    pub async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<()> {
        let mut in_progress = Vec::new();
        self.execute_tracked(task.clone(), &mut in_progress, cancel).await
    }

    /// Fetch by id, then [`execute`](Self::execute).
    pub async fn execute_by_id(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        let task = self.tasks.get(task_id).await?;
        self.execute(&task, cancel).await
    }

    fn execute_tracked<'a>(
        &'a self,
        task: Task,
        in_progress: &'a mut Vec<String>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if in_progress.iter().any(|id| id == &task.id) {
                let mut chain = in_progress.clone();
                chain.push(task.id.clone());
                return Err(TaskError::Cycle(chain));
            }

            in_progress.push(task.id.clone());
            let outcome = self.run_with_dependencies(&task, in_progress, cancel).await;
            in_progress.pop();

            if cancel.is_cancelled() || outcome.as_ref().is_err_and(TaskError::is_cancelled) {
                warn!(task_id = %task.id, "task run cancelled, leaving status as is");
                return Err(TaskError::Cancelled);
            }
            self.finalize(&task.id, &outcome).await;
            outcome
        }
        .boxed()
    }

    async fn run_with_dependencies(
        &self,
        task: &Task,
        in_progress: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !task.depends_on.is_empty() {
            info!(task_id = %task.id, dependencies = task.depends_on.len(), "resolving dependencies");
        }

        for dep in &task.depends_on {
            let dependency = self.tasks.get(&dep.id).await.map_err(|e| TaskError::Dependency {
                task: task.id.clone(),
                dependency: dep.id.clone(),
                reason: e.to_string(),
            })?;

            debug!(task_id = %task.id, dependency = %dep.id, "executing dependency");
            match self.execute_tracked(dependency, in_progress, cancel).await {
                Ok(()) => {}
                Err(e @ (TaskError::Cycle(_) | TaskError::Cancelled)) => return Err(e),
                Err(e) => {
                    return Err(TaskError::Dependency {
                        task: task.id.clone(),
                        dependency: dep.id.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        self.run_body(task, cancel).await
    }

    async fn run_body(&self, task: &Task, cancel: &CancellationToken) -> Result<()> {
        let component = self.components.get(&task.component_id).await?;
        let controller = self.resources.get(&component.kind)?;

        self.mark_running(&task.id).await?;
        info!(
            task_id = %task.id,
            task_type = %task.kind,
            component_id = %component.id,
            component_type = %component.kind,
            "running task"
        );

        self.run_prechecks(task, cancel).await?;
        controller
            .run_task(&task.controller_metadata(), &component.metadata, cancel)
            .await?;
        Ok(())
    }

    /// Move to `Running` unless the watchdog already did.
    async fn mark_running(&self, task_id: &str) -> Result<()> {
        let mut started = false;
        let tasks = self.tasks.as_ref();
        tasks
            .modify(
                task_id,
                Box::new(|task: &mut Task| {
                    if task.last_status() != Status::Running {
                        advance_status(tasks, task, Status::Running);
                        tasks.add_event(&mut task.event_history, "Task started");
                        started = true;
                    }
                }),
            )
            .await?;
        if !started {
            debug!(task_id, "task already running");
        }
        Ok(())
    }

    async fn run_prechecks(&self, task: &Task, cancel: &CancellationToken) -> Result<()> {
        for check in &task.pre_checks {
            let precheck_failed = |reason: String| TaskError::Precheck {
                check: check.id.clone(),
                reason,
            };

            let monitoring = self
                .monitorings
                .get(&check.monitoring_id)
                .await
                .map_err(|e| precheck_failed(e.to_string()))?;
            let monitor = self
                .monitors
                .get(&monitoring.kind)
                .map_err(|e| precheck_failed(e.to_string()))?;

            debug!(task_id = %task.id, check_id = %check.id, monitoring_id = %monitoring.id, "running pre-check");
            monitor
                .run_check(&monitoring.config, cancel)
                .await
                .map_err(|e| {
                    if matches!(e, crate::controller::ControllerError::Cancelled) {
                        TaskError::Cancelled
                    } else {
                        precheck_failed(e.to_string())
                    }
                })?;
        }
        Ok(())
    }

    async fn finalize(&self, task_id: &str, outcome: &Result<()>) {
        let _guard = self.finalize_lock.lock().await;
        let (status, message) = match outcome {
            Ok(()) => {
                info!(task_id, "task completed successfully");
                (Status::Success, "Task completed".to_string())
            }
            Err(e) => {
                error!(task_id, error = %e, "task failed");
                (Status::Failed, e.to_string())
            }
        };
        match record_transition(self.tasks.as_ref(), task_id, status, message).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!(task_id, "task removed before completion"),
            Err(e) => error!(task_id, error = %e, "failed to record task outcome"),
        }
    }

    /// Run every task of a plan in order, stopping at the first failure.
    pub async fn run_plan(&self, plan_id: &str, cancel: &CancellationToken) -> Result<()> {
        let plan = self.plans.get(plan_id).await?;
        record_transition(self.plans.as_ref(), plan_id, Status::Running, "Plan started").await?;
        info!(plan_id, tasks = plan.tasks.len(), "running plan");

        let mut outcome = Ok(());
        for task_ref in &plan.tasks {
            let step = match self.tasks.get(&task_ref.id).await {
                Ok(task) => self.execute(&task, cancel).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = step {
                outcome = Err(e);
                break;
            }
        }

        if outcome.as_ref().is_err_and(TaskError::is_cancelled) {
            warn!(plan_id, "plan run cancelled");
            return outcome;
        }

        let (status, message) = match &outcome {
            Ok(()) => (Status::Success, "Plan completed".to_string()),
            Err(e) => (Status::Failed, format!("Plan failed: {e}")),
        };
        if let Err(e) = record_transition(self.plans.as_ref(), plan_id, status, message).await {
            error!(plan_id, error = %e, "failed to record plan outcome");
        }
        outcome
    }

    /// Undo a task through its controller. Success only adds an event.
    pub async fn rollback(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        let task = self.tasks.get(task_id).await?;
        let component = self.components.get(&task.component_id).await?;
        let controller = self.resources.get(&component.kind)?;

        info!(task_id, component_id = %component.id, "rolling back task");
        match controller
            .rollback_task(&task.controller_metadata(), &component.metadata, cancel)
            .await
        {
            Ok(()) => {
                record_event(self.tasks.as_ref(), task_id, "Task rolled back").await?;
                Ok(())
            }
            Err(crate::controller::ControllerError::Cancelled) => Err(TaskError::Cancelled),
            Err(e) => {
                error!(task_id, error = %e, "rollback failed");
                let message = format!("Rollback failed: {e}");
                let _guard = self.finalize_lock.lock().await;
                record_transition(self.tasks.as_ref(), task_id, Status::Failed, message).await?;
                Err(e.into())
            }
        }
    }
}
