//! Status handlers shared by every entity kind.
//!
//! A [`Reconciler`] supplies the registry and the health probe for one kind;
//! the handlers here drive the status machine:
//!
//! | bucket  | handler        | probe ok                    | probe failed        |
//! |---------|----------------|-----------------------------|---------------------|
//! | Pending | `pending`      | Check, then Running         | Check, then Failed  |
//! | Running | `recheck`      | unchanged                   | Failed              |
//! | Failed  | `retry_failed` | Running + "recovered" event | unchanged           |
//!
//! Every write after a probe goes through the registry by id, so an entity
//! deleted mid-cycle is skipped rather than resurrected.
//!
//! Each probe and each running hook is bounded by the operation timeout. A
//! probe that overruns counts as a failed probe; a running hook that overruns
//! moves the entity to `Failed`. A claimed entity whose check is cancelled
//! goes back to `Pending`, so nothing is left in `Check`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{ControllerError, MonitorControllers, ResourceControllers};
use crate::model::{kind_title, Component, Entity, Monitoring, Status};
use crate::registry::{advance_status, record_transition, Registry, RegistryError};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("check timed out after {0:?}")]
    Timeout(Duration),
}

impl ProbeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Controller(ControllerError::Cancelled))
    }
}

/// Per-kind hooks used by the generic handlers.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Entity: Entity;

    fn registry(&self) -> &dyn Registry<Self::Entity>;

    /// Side-effect-free health check of `entity`.
    async fn probe(&self, entity: &Self::Entity, cancel: &CancellationToken) -> Result<(), ProbeError>;

    /// Runs after the entity was confirmed `Running` (first check or
    /// recovery).
    async fn on_running(&self, _entity: &Self::Entity, _cancel: &CancellationToken) {}
}

/// Handler selected by a status bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketHandler {
    Pending,
    Recheck,
    RetryFailed,
}

impl BucketHandler {
    /// The handler table. `Check` and `Success` have no periodic handler.
    pub fn for_status(status: Status) -> Option<Self> {
        match status {
            Status::Pending => Some(BucketHandler::Pending),
            Status::Running => Some(BucketHandler::Recheck),
            Status::Failed => Some(BucketHandler::RetryFailed),
            Status::Check | Status::Success => None,
        }
    }

    /// `timeout` bounds each probe and running hook; zero disables it.
    pub async fn run<R: Reconciler + ?Sized>(
        self,
        reconciler: &R,
        entity: R::Entity,
        timeout: Duration,
        cancel: &CancellationToken,
    ) {
        match self {
            BucketHandler::Pending => pending(reconciler, entity, timeout, cancel).await,
            BucketHandler::Recheck => recheck(reconciler, entity, timeout, cancel).await,
            BucketHandler::RetryFailed => retry_failed(reconciler, entity, timeout, cancel).await,
        }
    }
}

/// `None` when `fut` overran `timeout`.
async fn within<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    if timeout.is_zero() {
        return Some(fut.await);
    }
    tokio::time::timeout(timeout, fut).await.ok()
}

async fn probe_within<R: Reconciler + ?Sized>(
    reconciler: &R,
    entity: &R::Entity,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProbeError> {
    within(timeout, reconciler.probe(entity, cancel))
        .await
        .unwrap_or(Err(ProbeError::Timeout(timeout)))
}

/// Run the running hook; an overrun marks the entity `Failed`.
async fn confirm_running<R: Reconciler + ?Sized>(
    reconciler: &R,
    current: R::Entity,
    timeout: Duration,
    cancel: &CancellationToken,
) {
    let kind = <R::Entity as Entity>::KIND;
    let id = current.id().to_string();
    if within(timeout, reconciler.on_running(&current, cancel)).await.is_some() {
        return;
    }
    warn!(kind, id = %id, timeout = ?timeout, "running hook timed out");
    let message = format!(
        "{} timed out after {}",
        kind_title::<R::Entity>(),
        humantime::format_duration(timeout)
    );
    settle(reconciler.registry(), &id, Status::Failed, message).await;
}

/// Move a pending entity to `Check`, then probe it.
pub async fn pending<R: Reconciler + ?Sized>(
    reconciler: &R,
    entity: R::Entity,
    timeout: Duration,
    cancel: &CancellationToken,
) {
    let kind = <R::Entity as Entity>::KIND;
    let id = entity.id().to_string();

    let mut claimed = false;
    let registry = reconciler.registry();
    let outcome = registry
        .modify(
            &id,
            Box::new(|stored: &mut R::Entity| {
                if stored.last_status() == Status::Pending {
                    advance_status(registry, stored, Status::Check);
                    claimed = true;
                }
            }),
        )
        .await;

    match outcome {
        Ok(_) if claimed => {}
        Ok(_) => {
            debug!(kind, id = %id, "no longer pending, skipping");
            return;
        }
        Err(e) if e.is_not_found() => return,
        Err(e) => {
            error!(kind, id = %id, error = %e, "failed to move entity to check");
            return;
        }
    }

    check_and_update(reconciler, entity, timeout, cancel).await;
}

/// Probe a claimed entity and settle on `Running` or `Failed`.
pub async fn check_and_update<R: Reconciler + ?Sized>(
    reconciler: &R,
    entity: R::Entity,
    timeout: Duration,
    cancel: &CancellationToken,
) {
    let kind = <R::Entity as Entity>::KIND;
    let id = entity.id().to_string();
    debug!(kind, id = %id, "checking");

    match probe_within(reconciler, &entity, timeout, cancel).await {
        Err(e) if e.is_cancelled() => {
            debug!(kind, id = %id, "check cancelled, releasing claim");
            release_claim(reconciler.registry(), &id).await;
        }
        Err(e) => {
            error!(kind, id = %id, error = %e, "check failed");
            settle(reconciler.registry(), &id, Status::Failed, e.to_string()).await;
        }
        Ok(()) => {
            let message = format!("{} status updated to running", kind_title::<R::Entity>());
            if let Some(current) = settle(reconciler.registry(), &id, Status::Running, message).await {
                info!(kind, id = %id, "status updated to running");
                confirm_running(reconciler, current, timeout, cancel).await;
            }
        }
    }
}

/// Put an entity still in `Check` back to `Pending`.
async fn release_claim<E: Entity>(registry: &dyn Registry<E>, id: &str) {
    let outcome = registry
        .modify(
            id,
            Box::new(|stored: &mut E| {
                if stored.last_status() == Status::Check {
                    advance_status(registry, stored, Status::Pending);
                }
            }),
        )
        .await;
    if let Err(e) = outcome {
        if !e.is_not_found() {
            error!(kind = E::KIND, id = %id, error = %e, "failed to release check claim");
        }
    }
}

/// Confirm a running entity is still healthy.
pub async fn recheck<R: Reconciler + ?Sized>(
    reconciler: &R,
    entity: R::Entity,
    timeout: Duration,
    cancel: &CancellationToken,
) {
    let kind = <R::Entity as Entity>::KIND;
    let id = entity.id().to_string();

    match probe_within(reconciler, &entity, timeout, cancel).await {
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            warn!(kind, id = %id, error = %e, "failed recheck");
            settle(reconciler.registry(), &id, Status::Failed, e.to_string()).await;
        }
        Ok(()) => debug!(kind, id = %id, "still healthy"),
    }
}

/// Try to recover a failed entity. A failed probe leaves it untouched.
pub async fn retry_failed<R: Reconciler + ?Sized>(
    reconciler: &R,
    entity: R::Entity,
    timeout: Duration,
    cancel: &CancellationToken,
) {
    let kind = <R::Entity as Entity>::KIND;
    let id = entity.id().to_string();
    debug!(kind, id = %id, "retrying failed entity");

    match probe_within(reconciler, &entity, timeout, cancel).await {
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            warn!(kind, id = %id, error = %e, "retry failed");
        }
        Ok(()) => {
            let message = format!("{} recovered and set to running", kind_title::<R::Entity>());
            if let Some(current) = settle(reconciler.registry(), &id, Status::Running, message).await {
                info!(kind, id = %id, "recovered and set to running");
                confirm_running(reconciler, current, timeout, cancel).await;
            }
        }
    }
}

/// Record a transition by id. Missing entities are skipped; other registry
/// errors are logged and the cycle abandoned.
async fn settle<E: Entity>(
    registry: &dyn Registry<E>,
    id: &str,
    status: Status,
    message: String,
) -> Option<E> {
    match record_transition(registry, id, status, message).await {
        Ok(Some(entity)) => Some(entity),
        Ok(None) => {
            debug!(kind = E::KIND, id = %id, "entity removed during check, skipping");
            None
        }
        Err(e) => {
            error!(kind = E::KIND, id = %id, %status, error = %e, "failed to record status");
            None
        }
    }
}

/// Components are probed with their resource controller's health check.
pub struct ComponentReconciler {
    registry: Arc<dyn Registry<Component>>,
    controllers: Arc<ResourceControllers>,
}

impl ComponentReconciler {
    pub fn new(registry: Arc<dyn Registry<Component>>, controllers: Arc<ResourceControllers>) -> Self {
        Self {
            registry,
            controllers,
        }
    }
}

#[async_trait]
impl Reconciler for ComponentReconciler {
    type Entity = Component;

    fn registry(&self) -> &dyn Registry<Component> {
        self.registry.as_ref()
    }

    async fn probe(&self, entity: &Component, cancel: &CancellationToken) -> Result<(), ProbeError> {
        let controller = self.controllers.get(&entity.kind)?;
        controller.check_component(&entity.metadata, cancel).await?;
        Ok(())
    }
}

/// Monitorings are probed with their monitor controller.
pub struct MonitoringReconciler {
    registry: Arc<dyn Registry<Monitoring>>,
    controllers: Arc<MonitorControllers>,
}

impl MonitoringReconciler {
    pub fn new(registry: Arc<dyn Registry<Monitoring>>, controllers: Arc<MonitorControllers>) -> Self {
        Self {
            registry,
            controllers,
        }
    }
}

#[async_trait]
impl Reconciler for MonitoringReconciler {
    type Entity = Monitoring;

    fn registry(&self) -> &dyn Registry<Monitoring> {
        self.registry.as_ref()
    }

    async fn probe(&self, entity: &Monitoring, cancel: &CancellationToken) -> Result<(), ProbeError> {
        let controller = self.controllers.get(&entity.kind)?;
        controller.check_monitoring(&entity.config, cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ResourceController, Result as ControllerResult};
    use crate::model::{Metadata, StatusHistory};
    use crate::registry::MemoryRegistry;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const LIMIT: Duration = Duration::from_secs(5);

    struct Switch {
        healthy: AtomicBool,
        hang: AtomicBool,
        calls: AtomicUsize,
    }

    impl Switch {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                hang: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ResourceController for Switch {
        fn validate_component(&self, _: &Metadata) -> ControllerResult<()> {
            Ok(())
        }
        async fn check_component(&self, _: &Metadata, cancel: &CancellationToken) -> ControllerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                cancel.cancelled().await;
                return Err(ControllerError::Cancelled);
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ControllerError::Execution("probe down".into()))
            }
        }
        fn validate_task(&self, _: &Metadata) -> ControllerResult<()> {
            Ok(())
        }
        async fn run_task(&self, _: &Metadata, _: &Metadata, _: &CancellationToken) -> ControllerResult<()> {
            Ok(())
        }
    }

    async fn setup(
        healthy: bool,
        status: Option<Status>,
    ) -> (ComponentReconciler, Arc<MemoryRegistry<Component>>, Arc<Switch>, Component) {
        let registry = Arc::new(MemoryRegistry::<Component>::new());
        let switch = Switch::new(healthy);
        let mut controllers = ResourceControllers::new();
        controllers.register("fake", switch.clone());

        let mut comp = Component::new("fake", Metadata::new());
        if let Some(status) = status {
            comp.status_history = Some(StatusHistory::new(status));
        }
        let comp = registry.register(comp).await.unwrap();
        let reconciler = ComponentReconciler::new(registry.clone(), Arc::new(controllers));
        (reconciler, registry, switch, comp)
    }

    #[test]
    fn test_handler_table() {
        assert_eq!(BucketHandler::for_status(Status::Pending), Some(BucketHandler::Pending));
        assert_eq!(BucketHandler::for_status(Status::Running), Some(BucketHandler::Recheck));
        assert_eq!(BucketHandler::for_status(Status::Failed), Some(BucketHandler::RetryFailed));
        assert_eq!(BucketHandler::for_status(Status::Check), None);
        assert_eq!(BucketHandler::for_status(Status::Success), None);
    }

    #[tokio::test]
    async fn test_pending_healthy_goes_running_via_check() {
        let (rec, reg, _, comp) = setup(true, None).await;
        let token = CancellationToken::new();
        pending(&rec, comp.clone(), LIMIT, &token).await;

        let stored = reg.get(&comp.id).await.unwrap();
        let history = stored.status_history.unwrap();
        assert_eq!(history.last_status, Status::Running);
        assert_eq!(history.previous, vec![Status::Check]);
        assert_eq!(stored.event_history.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_unhealthy_goes_failed_via_check() {
        let (rec, reg, _, comp) = setup(false, Some(Status::Pending)).await;
        let token = CancellationToken::new();
        pending(&rec, comp.clone(), LIMIT, &token).await;

        let stored = reg.get(&comp.id).await.unwrap();
        let history = stored.status_history.unwrap();
        assert_eq!(history.last_status, Status::Failed);
        assert_eq!(history.previous, vec![Status::Pending, Status::Check]);
        assert_eq!(stored.event_history.len(), 1);
        assert!(stored.event_history.last().unwrap().message.contains("probe down"));
    }

    #[tokio::test]
    async fn test_pending_skips_already_claimed_entity() {
        let (rec, reg, switch, comp) = setup(true, Some(Status::Running)).await;
        let token = CancellationToken::new();
        pending(&rec, comp.clone(), LIMIT, &token).await;

        assert_eq!(switch.calls.load(Ordering::SeqCst), 0);
        assert_eq!(reg.get(&comp.id).await.unwrap().last_status(), Status::Running);
    }

    #[tokio::test]
    async fn test_recheck_failure_marks_failed() {
        let (rec, reg, _, comp) = setup(false, Some(Status::Running)).await;
        let token = CancellationToken::new();
        recheck(&rec, comp.clone(), LIMIT, &token).await;
        assert_eq!(reg.get(&comp.id).await.unwrap().last_status(), Status::Failed);
    }

    #[tokio::test]
    async fn test_recheck_success_is_idle() {
        let (rec, reg, _, comp) = setup(true, Some(Status::Running)).await;
        let token = CancellationToken::new();
        recheck(&rec, comp.clone(), LIMIT, &token).await;
        let stored = reg.get(&comp.id).await.unwrap();
        assert_eq!(stored.last_status(), Status::Running);
        assert!(stored.event_history.is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_recovers() {
        let (rec, reg, _, comp) = setup(true, Some(Status::Failed)).await;
        let token = CancellationToken::new();
        retry_failed(&rec, comp.clone(), LIMIT, &token).await;

        let stored = reg.get(&comp.id).await.unwrap();
        assert_eq!(stored.last_status(), Status::Running);
        assert!(stored.event_history.last().unwrap().message.contains("recovered"));
    }

    // Failure on retry is deliberately a no-op: no transition, no event.
    #[tokio::test]
    async fn test_retry_failed_still_failing_is_noop() {
        let (rec, reg, switch, comp) = setup(false, Some(Status::Failed)).await;
        let token = CancellationToken::new();
        retry_failed(&rec, comp.clone(), LIMIT, &token).await;

        let stored = reg.get(&comp.id).await.unwrap();
        assert_eq!(switch.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stored.last_status(), Status::Failed);
        assert!(stored.status_history.unwrap().previous.is_empty());
        assert!(stored.event_history.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_mid_cycle_is_skipped() {
        let (rec, reg, _, comp) = setup(true, Some(Status::Failed)).await;
        reg.delete(&comp.id).await.unwrap();
        let token = CancellationToken::new();
        retry_failed(&rec, comp.clone(), LIMIT, &token).await;
        assert!(reg.get(&comp.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_controller_fails_entity_only() {
        let (rec, reg, _, _) = setup(true, None).await;
        let orphan = reg
            .register(Component::new("unknown", Metadata::new()))
            .await
            .unwrap();
        let token = CancellationToken::new();
        pending(&rec, orphan.clone(), LIMIT, &token).await;

        let stored = reg.get(&orphan.id).await.unwrap();
        assert_eq!(stored.last_status(), Status::Failed);
        assert!(stored
            .event_history
            .last()
            .unwrap()
            .message
            .contains("no controller registered"));
    }

    #[tokio::test]
    async fn test_concurrent_pending_and_retry_do_not_tear() {
        let (rec, reg, _, comp) = setup(true, None).await;
        let rec = Arc::new(rec);
        let token = CancellationToken::new();

        let a = {
            let rec = rec.clone();
            let comp = comp.clone();
            let token = token.clone();
            tokio::spawn(async move { pending(rec.as_ref(), comp, LIMIT, &token).await })
        };
        let b = {
            let rec = rec.clone();
            let comp = comp.clone();
            let token = token.clone();
            tokio::spawn(async move { retry_failed(rec.as_ref(), comp, LIMIT, &token).await })
        };
        a.await.unwrap();
        b.await.unwrap();

        let stored = reg.get(&comp.id).await.unwrap();
        assert_eq!(stored.last_status(), Status::Running);
        assert!(!stored.event_history.is_empty());
        assert!(stored
            .event_history
            .iter()
            .all(|e| e.message.contains("running")));
    }

    #[tokio::test]
    async fn test_probe_overrun_fails_instead_of_sticking_in_check() {
        let (rec, reg, switch, comp) = setup(true, None).await;
        switch.hang.store(true, Ordering::SeqCst);
        let token = CancellationToken::new();
        pending(&rec, comp.clone(), Duration::from_millis(30), &token).await;

        let stored = reg.get(&comp.id).await.unwrap();
        let history = stored.status_history.unwrap();
        assert_eq!(history.last_status, Status::Failed);
        assert_eq!(history.previous, vec![Status::Check]);
        assert_eq!(stored.event_history.len(), 1);
        assert!(stored.event_history.last().unwrap().message.contains("timed out after 30ms"));
    }

    #[tokio::test]
    async fn test_cancelled_check_returns_to_pending() {
        let (rec, reg, switch, comp) = setup(true, Some(Status::Pending)).await;
        switch.hang.store(true, Ordering::SeqCst);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        pending(&rec, comp.clone(), LIMIT, &token).await;

        let stored = reg.get(&comp.id).await.unwrap();
        assert_eq!(stored.last_status(), Status::Pending);
        assert!(stored.event_history.is_empty());
    }

    struct StuckHook {
        inner: ComponentReconciler,
    }

    #[async_trait]
    impl Reconciler for StuckHook {
        type Entity = Component;

        fn registry(&self) -> &dyn Registry<Component> {
            self.inner.registry()
        }

        async fn probe(&self, entity: &Component, cancel: &CancellationToken) -> Result<(), ProbeError> {
            self.inner.probe(entity, cancel).await
        }

        async fn on_running(&self, _entity: &Component, _cancel: &CancellationToken) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_running_hook_overrun_marks_failed() {
        let (inner, reg, _, comp) = setup(true, None).await;
        let rec = StuckHook { inner };
        let token = CancellationToken::new();
        pending(&rec, comp.clone(), Duration::from_millis(30), &token).await;

        let stored = reg.get(&comp.id).await.unwrap();
        assert_eq!(stored.last_status(), Status::Failed);
        assert_eq!(
            stored.status_history.unwrap().previous,
            vec![Status::Check, Status::Running]
        );
        assert!(stored.event_history.last().unwrap().message.contains("Component timed out"));
    }
}
