//! End-to-end reconciliation through the service facade and real watchdogs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use watchkeeper::controller::{
    ControllerError, MonitorController, MonitorControllers, ResourceController, ResourceControllers,
    Result,
};
use watchkeeper::core::Core;
use watchkeeper::model::{Component, Entity, Metadata, Monitoring, Status, Task};
use watchkeeper::scheduler::{Watchdog, WatchdogOptions};

#[derive(Default)]
struct Switchable {
    down: AtomicBool,
    /// Hang the next check until cancelled.
    stall_check: AtomicBool,
    stall_runs: AtomicBool,
    checks: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait]
impl ResourceController for Switchable {
    fn validate_component(&self, _: &Metadata) -> Result<()> {
        Ok(())
    }

    async fn check_component(&self, _: &Metadata, cancel: &CancellationToken) -> Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.stall_check.swap(false, Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(ControllerError::Cancelled);
        }
        if self.down.load(Ordering::SeqCst) {
            Err(ControllerError::Transport("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn validate_task(&self, _: &Metadata) -> Result<()> {
        Ok(())
    }

    async fn run_task(&self, _: &Metadata, _: &Metadata, cancel: &CancellationToken) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.stall_runs.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(ControllerError::Cancelled);
        }
        Ok(())
    }
}

struct EmptyMetrics;

#[async_trait]
impl MonitorController for EmptyMetrics {
    fn validate_check(&self, _: &Metadata) -> Result<()> {
        Ok(())
    }

    fn validate_monitoring(&self, _: &Metadata) -> Result<()> {
        Ok(())
    }

    async fn run_check(&self, _: &Metadata, _: &CancellationToken) -> Result<()> {
        Err(ControllerError::Execution("metrics query returned no data".into()))
    }
}

fn options(pending_ms: u64, running_ms: u64, failed_ms: u64) -> WatchdogOptions {
    WatchdogOptions {
        pending_interval: Duration::from_millis(pending_ms),
        running_interval: Duration::from_millis(running_ms),
        failed_interval: Duration::from_millis(failed_ms),
        max_workers: 4,
        queue_capacity: 32,
        operation_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(5),
    }
}

fn core(fake: Arc<Switchable>) -> Core {
    let mut resources = ResourceControllers::new();
    resources.register("fake", fake);
    let mut monitors = MonitorControllers::new();
    monitors.register("empty", Arc::new(EmptyMetrics));
    Core::new(resources, monitors, CancellationToken::new())
}

#[derive(Clone, Copy)]
enum Kind {
    Component,
    Monitoring,
    Task,
}

async fn wait_for(core: &Core, kind: Kind, id: &str, want: Status) {
    for _ in 0..200 {
        let status = match kind {
            Kind::Component => core.get_component(id).await.unwrap().last_status(),
            Kind::Monitoring => core.get_monitoring(id).await.unwrap().last_status(),
            Kind::Task => core.get_task(id).await.unwrap().last_status(),
        };
        if status == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} never reached {want}");
}

#[tokio::test]
async fn test_component_lifecycle_pending_failed_recovered() {
    let fake = Arc::new(Switchable::default());
    fake.down.store(true, Ordering::SeqCst);
    let core = Arc::new(core(fake.clone()));
    let comp = core
        .register_component(Component::new("fake", Metadata::new()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(
        Watchdog::new(Arc::new(core.component_reconciler()), options(20, 20, 20)).run(cancel.clone()),
    );

    wait_for(&core, Kind::Component, &comp.id, Status::Failed).await;
    let failed = core.get_component(&comp.id).await.unwrap();
    assert_eq!(failed.status_history.as_ref().unwrap().previous, vec![Status::Pending, Status::Check]);
    // registration event + failure event
    assert_eq!(failed.event_history.len(), 2);

    fake.down.store(false, Ordering::SeqCst);
    wait_for(&core, Kind::Component, &comp.id, Status::Running).await;
    let recovered = core.get_component(&comp.id).await.unwrap();
    assert!(recovered.event_history.iter().any(|e| e.message.contains("recovered")));

    cancel.cancel();
    watchdog.await.unwrap();
}

#[tokio::test]
async fn test_disabled_component_keeps_status() {
    let fake = Arc::new(Switchable::default());
    let core = Arc::new(core(fake.clone()));
    let comp = core
        .register_component(Component::new("fake", Metadata::new()))
        .await
        .unwrap();
    core.set_component_enabled(&comp.id, false).await.unwrap();

    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(
        Watchdog::new(Arc::new(core.component_reconciler()), options(20, 20, 20)).run(cancel.clone()),
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();
    watchdog.await.unwrap();

    assert_eq!(fake.checks.load(Ordering::SeqCst), 0);
    assert_eq!(core.get_component(&comp.id).await.unwrap().last_status(), Status::Pending);
}

#[tokio::test]
async fn test_monitoring_with_no_data_fails() {
    let core = Arc::new(core(Arc::new(Switchable::default())));
    let monitoring = core
        .register_monitoring(Monitoring::new("empty", Metadata::new()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(
        Watchdog::new(Arc::new(core.monitoring_reconciler()), options(20, 0, 0)).run(cancel.clone()),
    );
    wait_for(&core, Kind::Monitoring, &monitoring.id, Status::Failed).await;
    cancel.cancel();
    watchdog.await.unwrap();

    let stored = core.get_monitoring(&monitoring.id).await.unwrap();
    assert!(stored.event_history.last().unwrap().message.contains("no data"));
}

#[tokio::test]
async fn test_pending_task_is_executed_once() {
    let fake = Arc::new(Switchable::default());
    let core = Arc::new(core(fake.clone()));
    let comp = core
        .register_component(Component::new("fake", Metadata::new()))
        .await
        .unwrap();
    let task = core
        .register_task(Task::new("apply", comp.id.clone(), Metadata::new()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(
        Watchdog::new(Arc::new(core.task_reconciler()), options(20, 0, 0)).run(cancel.clone()),
    );
    wait_for(&core, Kind::Task, &task.id, Status::Success).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    watchdog.await.unwrap();

    assert_eq!(fake.runs.load(Ordering::SeqCst), 1);
    let history = core.get_task(&task.id).await.unwrap().status_history.unwrap();
    assert_eq!(
        history.previous,
        vec![Status::Pending, Status::Check, Status::Running]
    );
}

#[tokio::test]
async fn test_deleted_entity_is_skipped() {
    let fake = Arc::new(Switchable::default());
    let core = Arc::new(core(fake.clone()));
    let comp = core
        .register_component(Component::new("fake", Metadata::new()))
        .await
        .unwrap();
    core.delete_component(&comp.id).await.unwrap();

    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(
        Watchdog::new(Arc::new(core.component_reconciler()), options(20, 20, 20)).run(cancel.clone()),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    watchdog.await.unwrap();

    assert!(core.get_component(&comp.id).await.is_err());
    assert_eq!(fake.checks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_hung_check_times_out_and_is_retried() {
    let fake = Arc::new(Switchable::default());
    fake.stall_check.store(true, Ordering::SeqCst);
    let core = Arc::new(core(fake.clone()));
    let comp = core
        .register_component(Component::new("fake", Metadata::new()))
        .await
        .unwrap();

    let mut opts = options(20, 20, 20);
    opts.operation_timeout = Duration::from_millis(50);
    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(
        Watchdog::new(Arc::new(core.component_reconciler()), opts).run(cancel.clone()),
    );

    wait_for(&core, Kind::Component, &comp.id, Status::Running).await;
    cancel.cancel();
    watchdog.await.unwrap();

    assert!(fake.checks.load(Ordering::SeqCst) >= 2);
    let stored = core.get_component(&comp.id).await.unwrap();
    let history = stored.status_history.unwrap();
    assert_eq!(history.previous, vec![Status::Pending, Status::Check, Status::Failed]);
    assert!(stored.event_history.iter().any(|e| e.message.contains("timed out after 50ms")));
}

#[tokio::test]
async fn test_shutdown_mid_check_returns_entity_to_pending() {
    let fake = Arc::new(Switchable::default());
    fake.stall_check.store(true, Ordering::SeqCst);
    let core = Arc::new(core(fake.clone()));
    let comp = core
        .register_component(Component::new("fake", Metadata::new()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(
        Watchdog::new(Arc::new(core.component_reconciler()), options(20, 0, 0)).run(cancel.clone()),
    );
    wait_for(&core, Kind::Component, &comp.id, Status::Check).await;
    cancel.cancel();
    watchdog.await.unwrap();

    let stored = core.get_component(&comp.id).await.unwrap();
    assert_eq!(stored.last_status(), Status::Pending);
    assert_eq!(fake.checks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_overrunning_task_is_failed_not_left_running() {
    let fake = Arc::new(Switchable::default());
    fake.stall_runs.store(true, Ordering::SeqCst);
    let core = Arc::new(core(fake.clone()));
    let comp = core
        .register_component(Component::new("fake", Metadata::new()))
        .await
        .unwrap();
    let task = core
        .register_task(Task::new("apply", comp.id.clone(), Metadata::new()))
        .await
        .unwrap();

    let mut opts = options(20, 0, 0);
    opts.operation_timeout = Duration::from_millis(50);
    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(
        Watchdog::new(Arc::new(core.task_reconciler()), opts).run(cancel.clone()),
    );
    wait_for(&core, Kind::Task, &task.id, Status::Failed).await;
    cancel.cancel();
    watchdog.await.unwrap();

    assert_eq!(fake.runs.load(Ordering::SeqCst), 1);
    let stored = core.get_task(&task.id).await.unwrap();
    assert!(stored.event_history.last().unwrap().message.contains("Task timed out"));
}
