//! Service facade over registries, controllers and the executor.
//!
//! Everything the control plane can do goes through [`Core`]: validated
//! registration, lookups, enable/disable, asynchronous runs and rollbacks.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::controller::{ControllerError, MonitorControllers, ResourceControllers};
use crate::model::{kind_title, restore_redacted, Component, Entity, Monitoring, Plan, Status, Task, TaskRef};
use crate::registry::{MemoryRegistry, Registry, RegistryError};
use crate::scheduler::{ComponentReconciler, MonitoringReconciler};
use crate::task::{RunKind, RunRecord, RunTracker, TaskError, TaskExecutor, TaskReconciler};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Registered controller type names.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerTypes {
    pub resources: Vec<String>,
    pub monitors: Vec<String>,
}

pub struct Core {
    components: Arc<dyn Registry<Component>>,
    monitorings: Arc<dyn Registry<Monitoring>>,
    tasks: Arc<dyn Registry<Task>>,
    plans: Arc<dyn Registry<Plan>>,
    resources: Arc<ResourceControllers>,
    monitors: Arc<MonitorControllers>,
    executor: Arc<TaskExecutor>,
    runs: RunTracker,
}

/// Fresh `Pending` history plus the registration event.
fn initialize<E: Entity>(registry: &dyn Registry<E>, entity: &mut E) {
    *entity.status_history_mut() = Some(registry.new_status(Status::Pending));
    registry.add_event(entity.events_mut(), &format!("{} registered", kind_title::<E>()));
}

impl Core {
    /// In-memory registries; runs observe `cancel`.
    pub fn new(
        resources: ResourceControllers,
        monitors: MonitorControllers,
        cancel: CancellationToken,
    ) -> Self {
        let components: Arc<dyn Registry<Component>> = Arc::new(MemoryRegistry::new());
        let monitorings: Arc<dyn Registry<Monitoring>> = Arc::new(MemoryRegistry::new());
        let tasks: Arc<dyn Registry<Task>> = Arc::new(MemoryRegistry::new());
        let plans: Arc<dyn Registry<Plan>> = Arc::new(MemoryRegistry::new());
        let resources = Arc::new(resources);
        let monitors = Arc::new(monitors);

        let executor = Arc::new(TaskExecutor::new(
            tasks.clone(),
            components.clone(),
            monitorings.clone(),
            plans.clone(),
            resources.clone(),
            monitors.clone(),
        ));

        Self {
            components,
            monitorings,
            tasks,
            plans,
            resources,
            monitors,
            executor,
            runs: RunTracker::new(cancel),
        }
    }

    pub fn component_reconciler(&self) -> ComponentReconciler {
        ComponentReconciler::new(self.components.clone(), self.resources.clone())
    }

    pub fn monitoring_reconciler(&self) -> MonitoringReconciler {
        MonitoringReconciler::new(self.monitorings.clone(), self.monitors.clone())
    }

    pub fn task_reconciler(&self) -> TaskReconciler {
        TaskReconciler::new(self.executor.clone())
    }

    pub fn controller_types(&self) -> ControllerTypes {
        ControllerTypes {
            resources: self.resources.list_types(),
            monitors: self.monitors.list_types(),
        }
    }

    // -- components ---------------------------------------------------------

    pub async fn register_component(&self, mut component: Component) -> Result<Component> {
        self.resources
            .get(&component.kind)?
            .validate_component(&component.metadata)?;
        initialize(self.components.as_ref(), &mut component);
        let stored = self.components.register(component).await?;
        info!(id = %stored.id, kind = %stored.kind, "component registered");
        Ok(stored)
    }

    pub async fn get_component(&self, id: &str) -> Result<Component> {
        Ok(self.components.get(id).await?)
    }

    pub async fn list_components(&self) -> Result<Vec<Component>> {
        Ok(self.components.list().await?)
    }

    /// Replace type, metadata and enabled flag; status and events are kept.
    pub async fn update_component(&self, id: &str, update: Component) -> Result<Component> {
        self.resources
            .get(&update.kind)?
            .validate_component(&update.metadata)?;
        let components = self.components.as_ref();
        let updated = components
            .modify(
                id,
                Box::new(move |stored: &mut Component| {
                    let mut update = update;
                    restore_redacted(&mut update.metadata, &stored.metadata);
                    stored.kind = update.kind;
                    stored.metadata = update.metadata;
                    stored.enabled = update.enabled;
                    components.add_event(&mut stored.event_history, "Component updated");
                }),
            )
            .await?;
        Ok(updated)
    }

    pub async fn delete_component(&self, id: &str) -> Result<()> {
        self.components.delete(id).await?;
        info!(id, "component deleted");
        Ok(())
    }

    pub async fn set_component_enabled(&self, id: &str, enabled: bool) -> Result<Component> {
        let components = self.components.as_ref();
        let updated = components
            .modify(
                id,
                Box::new(move |stored: &mut Component| {
                    stored.enabled = enabled;
                    let message = if enabled { "Component enabled" } else { "Component disabled" };
                    components.add_event(&mut stored.event_history, message);
                }),
            )
            .await?;
        info!(id, enabled, "component toggled");
        Ok(updated)
    }

    // -- monitorings --------------------------------------------------------

    pub async fn register_monitoring(&self, mut monitoring: Monitoring) -> Result<Monitoring> {
        self.monitors
            .get(&monitoring.kind)?
            .validate_monitoring(&monitoring.config)?;
        initialize(self.monitorings.as_ref(), &mut monitoring);
        let stored = self.monitorings.register(monitoring).await?;
        info!(id = %stored.id, kind = %stored.kind, "monitoring registered");
        Ok(stored)
    }

    pub async fn get_monitoring(&self, id: &str) -> Result<Monitoring> {
        Ok(self.monitorings.get(id).await?)
    }

    pub async fn list_monitorings(&self) -> Result<Vec<Monitoring>> {
        Ok(self.monitorings.list().await?)
    }

    pub async fn update_monitoring(&self, id: &str, update: Monitoring) -> Result<Monitoring> {
        self.monitors
            .get(&update.kind)?
            .validate_monitoring(&update.config)?;
        let monitorings = self.monitorings.as_ref();
        let updated = monitorings
            .modify(
                id,
                Box::new(move |stored: &mut Monitoring| {
                    let mut update = update;
                    restore_redacted(&mut update.config, &stored.config);
                    stored.kind = update.kind;
                    stored.config = update.config;
                    monitorings.add_event(&mut stored.event_history, "Monitoring updated");
                }),
            )
            .await?;
        Ok(updated)
    }

    pub async fn delete_monitoring(&self, id: &str) -> Result<()> {
        self.monitorings.delete(id).await?;
        info!(id, "monitoring deleted");
        Ok(())
    }

    // -- tasks --------------------------------------------------------------

    /// The component, dependencies and pre-check monitorings must exist.
    async fn validate_task(&self, task: &mut Task) -> Result<()> {
        let component = self.components.get(&task.component_id).await?;
        self.resources
            .get(&component.kind)?
            .validate_task(&task.metadata)?;

        for dep in &task.depends_on {
            self.tasks.get(&dep.id).await?;
        }

        for check in &mut task.pre_checks {
            let monitoring = self.monitorings.get(&check.monitoring_id).await?;
            self.monitors
                .get(&monitoring.kind)?
                .validate_check(&monitoring.config)?;
            if check.id.is_empty() {
                check.id = Uuid::new_v4().to_string();
            }
        }
        Ok(())
    }

    pub async fn register_task(&self, mut task: Task) -> Result<Task> {
        self.validate_task(&mut task).await?;
        initialize(self.tasks.as_ref(), &mut task);
        let stored = self.tasks.register(task).await?;
        info!(id = %stored.id, kind = %stored.kind, component_id = %stored.component_id, "task registered");
        Ok(stored)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        Ok(self.tasks.get(id).await?)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.list().await?)
    }

    pub async fn update_task(&self, id: &str, mut update: Task) -> Result<Task> {
        self.validate_task(&mut update).await?;
        let tasks = self.tasks.as_ref();
        let updated = tasks
            .modify(
                id,
                Box::new(move |stored: &mut Task| {
                    restore_redacted(&mut update.metadata, &stored.metadata);
                    stored.kind = update.kind;
                    stored.metadata = update.metadata;
                    stored.component_id = update.component_id;
                    stored.depends_on = update.depends_on;
                    stored.pre_checks = update.pre_checks;
                    tasks.add_event(&mut stored.event_history, "Task updated");
                }),
            )
            .await?;
        Ok(updated)
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.tasks.delete(id).await?;
        info!(id, "task deleted");
        Ok(())
    }

    // -- plans --------------------------------------------------------------

    pub async fn register_plan(&self, tasks: Vec<TaskRef>) -> Result<Plan> {
        if tasks.is_empty() {
            return Err(RegistryError::Invalid {
                kind: Plan::KIND,
                reason: "a plan needs at least one task".to_string(),
            }
            .into());
        }
        for task in &tasks {
            self.tasks.get(&task.id).await?;
        }
        let mut plan = Plan::new(tasks);
        initialize(self.plans.as_ref(), &mut plan);
        let stored = self.plans.register(plan).await?;
        info!(id = %stored.id, tasks = stored.tasks.len(), "plan registered");
        Ok(stored)
    }

    pub async fn get_plan(&self, id: &str) -> Result<Plan> {
        Ok(self.plans.get(id).await?)
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>> {
        Ok(self.plans.list().await?)
    }

    pub async fn delete_plan(&self, id: &str) -> Result<()> {
        self.plans.delete(id).await?;
        info!(id, "plan deleted");
        Ok(())
    }

    // -- runs ---------------------------------------------------------------

    /// Execute a task in the background; returns the run id.
    pub async fn run_task_async(&self, task_id: &str) -> Result<String> {
        self.tasks.get(task_id).await?;
        let executor = self.executor.clone();
        let id = task_id.to_string();
        let run_id = self
            .runs
            .spawn(RunKind::Task, task_id, move |cancel| async move {
                executor.execute_by_id(&id, &cancel).await
            })
            .await;
        Ok(run_id)
    }

    pub async fn run_plan_async(&self, plan_id: &str) -> Result<String> {
        self.plans.get(plan_id).await?;
        let executor = self.executor.clone();
        let id = plan_id.to_string();
        let run_id = self
            .runs
            .spawn(RunKind::Plan, plan_id, move |cancel| async move {
                executor.run_plan(&id, &cancel).await
            })
            .await;
        Ok(run_id)
    }

    pub async fn rollback_task_async(&self, task_id: &str) -> Result<String> {
        self.tasks.get(task_id).await?;
        let executor = self.executor.clone();
        let id = task_id.to_string();
        let run_id = self
            .runs
            .spawn(RunKind::Rollback, task_id, move |cancel| async move {
                executor.rollback(&id, &cancel).await
            })
            .await;
        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.runs.get(run_id).await.ok_or_else(|| {
            RegistryError::NotFound {
                kind: "run",
                id: run_id.to_string(),
            }
            .into()
        })
    }

    pub async fn list_runs(&self) -> Vec<RunRecord> {
        self.runs.list().await
    }

    /// Wait for background runs to finish.
    pub async fn drain_runs(&self, timeout: Duration) -> bool {
        self.runs.shutdown(timeout).await
    }
}
