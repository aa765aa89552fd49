//! Controller capability contracts and the type-keyed controller registry.
//!
//! A *resource controller* manages components and runs tasks against them; a
//! *monitor controller* evaluates monitoring probes. Both are looked up by the
//! entity's `type` string. Every call that reaches a remote system takes a
//! [`CancellationToken`] so shutdown can interrupt it.

pub mod cluster;
pub mod promql;
pub mod ssh;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::Metadata;

pub use self::cluster::ClusterController;
pub use self::promql::PromQlController;
pub use self::ssh::{HostKeyPolicy, SshController};

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Missing or malformed metadata, rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no controller registered for type '{0}'")]
    NotRegistered(String),

    /// The remote system could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("host key rejected for {address}: {reason}")]
    HostKey { address: String, reason: String },

    /// The remote operation ran but reported failure.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} is not supported by this controller")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Capability set for resource types (components and the tasks run on them).
#[async_trait]
pub trait ResourceController: Send + Sync {
    /// Check component metadata without touching the remote system.
    fn validate_component(&self, metadata: &Metadata) -> Result<()>;

    /// Verify the component is healthy. Must not mutate it.
    async fn check_component(&self, metadata: &Metadata, cancel: &CancellationToken) -> Result<()>;

    fn validate_task(&self, task_metadata: &Metadata) -> Result<()>;

    /// Perform the task's mutating operation against the component.
    async fn run_task(
        &self,
        task_metadata: &Metadata,
        component_metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Undo a previously run task.
    async fn rollback_task(
        &self,
        _task_metadata: &Metadata,
        _component_metadata: &Metadata,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(ControllerError::Unsupported("rollback"))
    }
}

/// Capability set for monitoring types.
#[async_trait]
pub trait MonitorController: Send + Sync {
    /// Validate the parameters a task pre-check will run with.
    fn validate_check(&self, monitor_metadata: &Metadata) -> Result<()>;

    fn validate_monitoring(&self, config: &Metadata) -> Result<()>;

    async fn run_check(&self, monitor_metadata: &Metadata, cancel: &CancellationToken) -> Result<()>;

    /// Periodic health evaluation of a monitoring. Same probe as a pre-check.
    async fn check_monitoring(&self, config: &Metadata, cancel: &CancellationToken) -> Result<()> {
        self.run_check(config, cancel).await
    }
}

/// Controllers keyed by type string. Populated at startup, read-only after.
pub struct ControllerRegistry<C: ?Sized> {
    controllers: HashMap<String, Arc<C>>,
}

pub type ResourceControllers = ControllerRegistry<dyn ResourceController>;
pub type MonitorControllers = ControllerRegistry<dyn MonitorController>;

impl<C: ?Sized> ControllerRegistry<C> {
    pub fn new() -> Self {
        Self {
            controllers: HashMap::new(),
        }
    }

    /// Register `controller` under `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, controller: Arc<C>) {
        let kind = kind.into();
        if self.controllers.insert(kind.clone(), controller).is_some() {
            tracing::warn!(%kind, "controller replaced");
        } else {
            tracing::debug!(%kind, "controller registered");
        }
    }

    pub fn get(&self, kind: &str) -> Result<Arc<C>> {
        self.controllers
            .get(kind)
            .cloned()
            .ok_or_else(|| ControllerError::NotRegistered(kind.to_string()))
    }

    /// Registered type names, sorted.
    pub fn list_types(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.controllers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl<C: ?Sized> Default for ControllerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `fut`, giving up early if `cancel` fires.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ControllerError::Cancelled),
        res = fut => res,
    }
}

/// Non-empty value for `key`, or a validation error naming it.
pub(crate) fn required<'m>(metadata: &'m Metadata, key: &str, what: &str) -> Result<&'m str> {
    match metadata.get(key).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ControllerError::Validation(format!("{what} {key} is required"))),
    }
}

/// Parse durations written as `250ms`, `5s` or `1h 30m`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    humantime::parse_duration(raw)
        .map_err(|e| ControllerError::Validation(format!("invalid duration '{raw}': {e}")))
}
