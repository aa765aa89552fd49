//! Entity types tracked by the daemon and the status vocabulary they share.

pub mod status;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use self::status::{effective_status, Event, EventHistory, Status, StatusHistory};

/// Free-form string metadata attached to entities and handed to controllers.
pub type Metadata = HashMap<String, String>;

/// Placeholder shown instead of secret metadata values.
pub const REDACTED: &str = "********";

/// Key fragments whose values never leave the daemon.
const SECRET_KEY_PARTS: &[&str] = &["password", "passphrase", "secret", "token", "private_key"];

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEY_PARTS.iter().any(|part| key.contains(part))
}

/// Put back the stored value of every key a client echoed as [`REDACTED`].
pub fn restore_redacted(incoming: &mut Metadata, stored: &Metadata) {
    for (key, value) in incoming.iter_mut() {
        if value == REDACTED {
            if let Some(original) = stored.get(key) {
                value.clone_from(original);
            }
        }
    }
}

/// Copy of `metadata` with secret values masked.
pub fn redact(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .map(|(k, v)| {
            let value = if is_secret_key(k) { REDACTED.to_string() } else { v.clone() };
            (k.clone(), value)
        })
        .collect()
}

/// Common surface of every entity that carries a status and an audit trail.
///
/// The watchdog, the executor and the registry only talk to entities through
/// this trait, so one reconciliation routine serves every kind.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Human-readable kind, used in logs and errors.
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn status_history(&self) -> Option<&StatusHistory>;
    fn status_history_mut(&mut self) -> &mut Option<StatusHistory>;
    fn events(&self) -> &EventHistory;
    fn events_mut(&mut self) -> &mut EventHistory;

    /// Whether the watchdog should consider this entity at all.
    fn is_enabled(&self) -> bool {
        true
    }

    fn last_status(&self) -> Status {
        effective_status(self.status_history())
    }
}

/// `KIND` with its first letter capitalized, for event messages.
pub fn kind_title<E: Entity>() -> String {
    let mut chars = E::KIND.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

macro_rules! impl_entity {
    ($ty:ty, $kind:literal) => {
        impl Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }

            fn status_history(&self) -> Option<&StatusHistory> {
                self.status_history.as_ref()
            }

            fn status_history_mut(&mut self) -> &mut Option<StatusHistory> {
                &mut self.status_history
            }

            fn events(&self) -> &EventHistory {
                &self.event_history
            }

            fn events_mut(&mut self) -> &mut EventHistory {
                &mut self.event_history
            }
        }
    };
}

fn enabled_by_default() -> bool {
    true
}

/// An externally managed resource whose health is reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    #[serde(default)]
    pub id: String,
    /// Selects the resource controller.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status_history: Option<StatusHistory>,
    #[serde(default)]
    pub event_history: EventHistory,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl Component {
    pub fn new(kind: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            metadata,
            status_history: None,
            event_history: EventHistory::new(),
            enabled: true,
        }
    }

    /// Copy safe to hand to API clients.
    pub fn redacted(&self) -> Self {
        Self {
            metadata: redact(&self.metadata),
            ..self.clone()
        }
    }
}

impl Entity for Component {
    const KIND: &'static str = "component";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn status_history(&self) -> Option<&StatusHistory> {
        self.status_history.as_ref()
    }

    fn status_history_mut(&mut self) -> &mut Option<StatusHistory> {
        &mut self.status_history
    }

    fn events(&self) -> &EventHistory {
        &self.event_history
    }

    fn events_mut(&mut self) -> &mut EventHistory {
        &mut self.event_history
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// A configured health probe evaluated by a monitor controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitoring {
    #[serde(default)]
    pub id: String,
    /// Selects the monitor controller.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Metadata,
    #[serde(default)]
    pub status_history: Option<StatusHistory>,
    #[serde(default)]
    pub event_history: EventHistory,
}

impl Monitoring {
    pub fn new(kind: impl Into<String>, config: Metadata) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            config,
            status_history: None,
            event_history: EventHistory::new(),
        }
    }

    pub fn redacted(&self) -> Self {
        Self {
            config: redact(&self.config),
            ..self.clone()
        }
    }
}

impl_entity!(Monitoring, "monitoring");

/// Reference to another task by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
}

impl TaskRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Precondition linking a task to a monitoring that must pass first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    #[serde(default)]
    pub id: String,
    pub monitoring_id: String,
}

/// A unit of work run against a component through its resource controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub component_id: String,
    #[serde(default)]
    pub depends_on: Vec<TaskRef>,
    #[serde(default)]
    pub pre_checks: Vec<Check>,
    #[serde(default)]
    pub status_history: Option<StatusHistory>,
    #[serde(default)]
    pub event_history: EventHistory,
}

impl Task {
    pub fn new(kind: impl Into<String>, component_id: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            metadata,
            component_id: component_id.into(),
            depends_on: Vec::new(),
            pre_checks: Vec::new(),
            status_history: None,
            event_history: EventHistory::new(),
        }
    }

    /// Metadata handed to the controller: the task's own keys plus `id` and
    /// `type` when the caller did not set them.
    pub fn controller_metadata(&self) -> Metadata {
        let mut meta = self.metadata.clone();
        meta.entry("id".to_string()).or_insert_with(|| self.id.clone());
        meta.entry("type".to_string()).or_insert_with(|| self.kind.clone());
        meta
    }

    pub fn redacted(&self) -> Self {
        Self {
            metadata: redact(&self.metadata),
            ..self.clone()
        }
    }
}

impl_entity!(Task, "task");

/// An ordered group of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub id: String,
    pub tasks: Vec<TaskRef>,
    #[serde(default)]
    pub status_history: Option<StatusHistory>,
    #[serde(default)]
    pub event_history: EventHistory,
}

impl Plan {
    pub fn new(tasks: Vec<TaskRef>) -> Self {
        Self {
            id: String::new(),
            tasks,
            status_history: None,
            event_history: EventHistory::new(),
        }
    }
}

impl_entity!(Plan, "plan");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialised_entity_is_pending() {
        let comp = Component::new("ssh", Metadata::new());
        assert!(comp.status_history().is_none());
        assert_eq!(comp.last_status(), Status::Pending);
    }

    #[test]
    fn test_component_json_uses_type_key() {
        let json = r#"{"type":"ssh","metadata":{"host":"10.0.0.1"}}"#;
        let comp: Component = serde_json::from_str(json).unwrap();
        assert_eq!(comp.kind, "ssh");
        assert!(comp.enabled);
        assert_eq!(comp.metadata.get("host").unwrap(), "10.0.0.1");
    }

    #[test]
    fn test_disabled_component() {
        let mut comp = Component::new("ssh", Metadata::new());
        comp.enabled = false;
        assert!(!comp.is_enabled());
    }

    #[test]
    fn test_task_controller_metadata_fills_identity() {
        let mut meta = Metadata::new();
        meta.insert("command".into(), "uptime".into());
        let mut task = Task::new("deploy", "c1", meta);
        task.id = "t1".into();

        let out = task.controller_metadata();
        assert_eq!(out.get("id").unwrap(), "t1");
        assert_eq!(out.get("type").unwrap(), "deploy");
        assert_eq!(out.get("command").unwrap(), "uptime");
    }

    #[test]
    fn test_redacted_masks_secrets_only() {
        let mut meta = Metadata::new();
        meta.insert("host".into(), "10.0.0.5".into());
        meta.insert("password".into(), "hunter2".into());
        meta.insert("API_TOKEN".into(), "abc".into());
        let comp = Component::new("ssh", meta);

        let shown = comp.redacted();
        assert_eq!(shown.metadata["host"], "10.0.0.5");
        assert_eq!(shown.metadata["password"], REDACTED);
        assert_eq!(shown.metadata["API_TOKEN"], REDACTED);
        assert_eq!(comp.metadata["password"], "hunter2");
    }

    #[test]
    fn test_restore_redacted_keeps_stored_secret() {
        let mut stored = Metadata::new();
        stored.insert("password".into(), "hunter2".into());
        let mut incoming = redact(&stored);
        incoming.insert("host".into(), "10.0.0.9".into());

        restore_redacted(&mut incoming, &stored);
        assert_eq!(incoming["password"], "hunter2");
        assert_eq!(incoming["host"], "10.0.0.9");
    }
}
