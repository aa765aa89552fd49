use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{Mutation, Registry, RegistryError, Result};
use crate::model::Entity;

/// Process-local registry. The map lock guards membership; each entity has
/// its own lock guarding its fields.
pub struct MemoryRegistry<E> {
    entries: RwLock<HashMap<String, Arc<RwLock<E>>>>,
}

impl<E: Entity> MemoryRegistry<E> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn not_found(id: &str) -> RegistryError {
        RegistryError::NotFound {
            kind: E::KIND,
            id: id.to_string(),
        }
    }
}

impl<E: Entity> Default for MemoryRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Entity> Registry<E> for MemoryRegistry<E> {
    async fn register(&self, mut entity: E) -> Result<E> {
        if entity.id().is_empty() {
            entity.set_id(Uuid::new_v4().to_string());
        }
        let id = entity.id().to_string();

        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(RegistryError::Conflict { kind: E::KIND, id });
        }
        entries.insert(id.clone(), Arc::new(RwLock::new(entity.clone())));
        debug!(kind = E::KIND, id = %id, "entity registered");
        Ok(entity)
    }

    async fn get(&self, id: &str) -> Result<E> {
        let entries = self.entries.read().await;
        let slot = entries.get(id).ok_or_else(|| Self::not_found(id))?;
        let entity = slot.read().await.clone();
        Ok(entity)
    }

    async fn update(&self, id: &str, mut entity: E) -> Result<()> {
        let entries = self.entries.read().await;
        let slot = entries.get(id).ok_or_else(|| Self::not_found(id))?;
        entity.set_id(id.to_string());
        *slot.write().await = entity;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(id).ok_or_else(|| Self::not_found(id))?;
        debug!(kind = E::KIND, id = %id, "entity deleted");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<E>> {
        let entries = self.entries.read().await;
        let mut out = Vec::with_capacity(entries.len());
        for slot in entries.values() {
            out.push(slot.read().await.clone());
        }
        Ok(out)
    }

    async fn modify<'a>(&self, id: &str, mutation: Mutation<'a, E>) -> Result<E> {
        // Holding the map read lock keeps the entity from being deleted
        // while it is being edited.
        let entries = self.entries.read().await;
        let slot = entries.get(id).ok_or_else(|| Self::not_found(id))?;
        let mut entity = slot.write().await;
        mutation(&mut *entity);
        Ok(entity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Component, EventHistory, Metadata, Status, StatusHistory};
    use crate::registry::{record_event, record_transition, Mutation};
    use async_trait::async_trait;

    fn component() -> Component {
        Component::new("ssh", Metadata::new())
    }

    #[tokio::test]
    async fn test_register_assigns_id() {
        let reg = MemoryRegistry::<Component>::new();
        let stored = reg.register(component()).await.unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_conflict() {
        let reg = MemoryRegistry::<Component>::new();
        let mut c = component();
        c.id = "c1".into();
        reg.register(c.clone()).await.unwrap();
        let err = reg.register(c).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let reg = MemoryRegistry::<Component>::new();
        let err = reg.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let reg = MemoryRegistry::<Component>::new();
        let mut c = reg.register(component()).await.unwrap();
        c.enabled = false;
        reg.update(&c.id, c.clone()).await.unwrap();
        assert!(!reg.get(&c.id).await.unwrap().enabled);

        reg.delete(&c.id).await.unwrap();
        assert!(reg.is_empty().await);
        assert!(reg.delete(&c.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_record_transition_and_event() {
        let reg = MemoryRegistry::<Component>::new();
        let c = reg.register(component()).await.unwrap();

        let updated = record_transition(&reg, &c.id, Status::Check, "checking")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.last_status(), Status::Check);
        assert_eq!(updated.event_history.len(), 1);

        record_event(&reg, &c.id, "note").await.unwrap();
        let stored = reg.get(&c.id).await.unwrap();
        assert_eq!(stored.event_history.len(), 2);
        assert_eq!(stored.last_status(), Status::Check);
    }

    #[tokio::test]
    async fn test_record_transition_on_deleted_entity_is_skipped() {
        let reg = MemoryRegistry::<Component>::new();
        let outcome = record_transition(&reg, "gone", Status::Running, "x").await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_transitions_do_not_tear() {
        let reg = Arc::new(MemoryRegistry::<Component>::new());
        let c = reg.register(component()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let reg = reg.clone();
            let id = c.id.clone();
            let status = if i % 2 == 0 { Status::Running } else { Status::Failed };
            handles.push(tokio::spawn(async move {
                record_transition(reg.as_ref(), &id, status, format!("step {i}"))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = reg.get(&c.id).await.unwrap();
        let history = stored.status_history.unwrap();
        assert_eq!(history.previous.len(), 31);
        assert_eq!(stored.event_history.len(), 32);
        assert!(matches!(history.last_status, Status::Running | Status::Failed));
    }

    /// Delegates storage but stamps its own bookkeeping.
    struct Audited(MemoryRegistry<Component>);

    #[async_trait]
    impl Registry<Component> for Audited {
        async fn register(&self, entity: Component) -> Result<Component> {
            self.0.register(entity).await
        }
        async fn get(&self, id: &str) -> Result<Component> {
            self.0.get(id).await
        }
        async fn update(&self, id: &str, entity: Component) -> Result<()> {
            self.0.update(id, entity).await
        }
        async fn delete(&self, id: &str) -> Result<()> {
            self.0.delete(id).await
        }
        async fn list(&self) -> Result<Vec<Component>> {
            self.0.list().await
        }
        async fn modify<'a>(&self, id: &str, mutation: Mutation<'a, Component>) -> Result<Component> {
            self.0.modify(id, mutation).await
        }

        fn next_status(&self, status: Status, current: Option<&StatusHistory>) -> StatusHistory {
            let mut next = StatusHistory::next(status, current);
            next.previous.insert(0, Status::Pending);
            next
        }

        fn add_event(&self, history: &mut EventHistory, message: &str) {
            history.push(format!("[audited] {message}"));
        }
    }

    #[tokio::test]
    async fn test_transitions_use_registry_bookkeeping() {
        let reg = Audited(MemoryRegistry::new());
        let c = reg.register(component()).await.unwrap();

        let updated = record_transition(&reg, &c.id, Status::Running, "up")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.last_status(), Status::Running);
        assert_eq!(updated.status_history.unwrap().previous, vec![Status::Pending]);
        assert_eq!(updated.event_history.last().unwrap().message, "[audited] up");

        let noted = record_event(&reg, &c.id, "note").await.unwrap().unwrap();
        assert_eq!(noted.event_history.last().unwrap().message, "[audited] note");
    }
}
