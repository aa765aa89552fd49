//! Lifecycle status vocabulary shared by every tracked entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a component, monitoring, task or plan.
///
/// Transitions are explicit; the variant order carries no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Check,
    Running,
    Failed,
    Success,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Check => write!(f, "check"),
            Status::Running => write!(f, "running"),
            Status::Failed => write!(f, "failed"),
            Status::Success => write!(f, "success"),
        }
    }
}

/// Current status plus the ordered list of statuses it replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistory {
    pub last_status: Status,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub previous: Vec<Status>,
}

impl StatusHistory {
    /// Fresh history with no previous statuses.
    pub fn new(status: Status) -> Self {
        Self {
            last_status: status,
            timestamp: Utc::now(),
            previous: Vec::new(),
        }
    }

    /// Successor of `current` after transitioning to `status`.
    ///
    /// An absent history is a never-initialised entity and yields the same
    /// result as [`StatusHistory::new`].
    pub fn next(status: Status, current: Option<&StatusHistory>) -> Self {
        match current {
            None => Self::new(status),
            Some(current) => {
                let mut previous = current.previous.clone();
                previous.push(current.last_status);
                Self {
                    last_status: status,
                    timestamp: Utc::now(),
                    previous,
                }
            }
        }
    }
}

/// Status of a possibly-uninitialised history. Absent means `Pending`.
pub fn effective_status(history: Option<&StatusHistory>) -> Status {
    history.map(|h| h.last_status).unwrap_or(Status::Pending)
}

/// One audit line in an entity's event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Append-only, human-readable audit trail owned by an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventHistory(Vec<Event>);

impl EventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(Event {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&Event> {
        self.0.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.0.iter()
    }
}
