//! Entity registries: CRUD plus status/event bookkeeping per entity kind.
//!
//! The reconciliation core only depends on the [`Registry`] trait. The daemon
//! ships an in-memory implementation, [`MemoryRegistry`], where every entity
//! sits behind its own lock so status writes for one entity never block
//! another.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Entity, EventHistory, Status, StatusHistory};

pub use self::memory::MemoryRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    Conflict { kind: &'static str, id: String },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

impl RegistryError {
    /// A miss is a normal outcome for the watchdog (deleted mid-cycle).
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// In-place edit applied to an entity under its lock.
pub type Mutation<'a, E> = Box<dyn FnOnce(&mut E) + Send + 'a>;

/// Storage for one entity kind.
#[async_trait]
pub trait Registry<E: Entity>: Send + Sync {
    /// Store a new entity, assigning an id when it has none.
    async fn register(&self, entity: E) -> Result<E>;

    /// Snapshot of the entity with `id`.
    async fn get(&self, id: &str) -> Result<E>;

    /// Replace the stored entity with `id`.
    async fn update(&self, id: &str, entity: E) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Snapshot of every entity of this kind.
    async fn list(&self) -> Result<Vec<E>>;

    /// Apply `mutation` to the stored entity atomically and return the result.
    async fn modify<'a>(&self, id: &str, mutation: Mutation<'a, E>) -> Result<E>;

    fn new_status(&self, status: Status) -> StatusHistory {
        StatusHistory::new(status)
    }

    fn next_status(&self, status: Status, current: Option<&StatusHistory>) -> StatusHistory {
        StatusHistory::next(status, current)
    }

    fn add_event(&self, history: &mut EventHistory, message: &str) {
        history.push(message);
    }
}

/// Move `entity` to `status` with the registry's history bookkeeping.
pub fn advance_status<E, R>(registry: &R, entity: &mut E, status: Status)
where
    E: Entity,
    R: Registry<E> + ?Sized,
{
    let next = registry.next_status(status, entity.status_history());
    *entity.status_history_mut() = Some(next);
}

/// Transition the stored entity and record `message` in one locked step.
///
/// Returns `Ok(None)` when the entity no longer exists.
pub async fn record_transition<E, R>(
    registry: &R,
    id: &str,
    status: Status,
    message: impl Into<String>,
) -> Result<Option<E>>
where
    E: Entity,
    R: Registry<E> + ?Sized,
{
    let message = message.into();
    let outcome = registry
        .modify(
            id,
            Box::new(move |entity: &mut E| {
                advance_status(registry, entity, status);
                registry.add_event(entity.events_mut(), &message);
            }),
        )
        .await;
    skip_missing(outcome)
}

/// Append an event to the stored entity without touching its status.
pub async fn record_event<E, R>(
    registry: &R,
    id: &str,
    message: impl Into<String>,
) -> Result<Option<E>>
where
    E: Entity,
    R: Registry<E> + ?Sized,
{
    let message = message.into();
    let outcome = registry
        .modify(
            id,
            Box::new(move |entity: &mut E| registry.add_event(entity.events_mut(), &message)),
        )
        .await;
    skip_missing(outcome)
}

fn skip_missing<E>(outcome: Result<E>) -> Result<Option<E>> {
    match outcome {
        Ok(entity) => Ok(Some(entity)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
