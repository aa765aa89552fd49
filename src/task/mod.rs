//! Task execution: dependency walking, plan sequencing, rollback and the
//! tracker for runs started asynchronously.

mod executor;
mod reconciler;
mod runs;

use thiserror::Error;

use crate::controller::ControllerError;
use crate::registry::RegistryError;

pub use self::executor::TaskExecutor;
pub use self::reconciler::TaskReconciler;
pub use self::runs::{RunKind, RunRecord, RunTracker};

#[derive(Debug, Error)]
pub enum TaskError {
    /// A dependency could not be fetched or did not complete.
    #[error("dependency '{dependency}' of task '{task}' failed: {reason}")]
    Dependency {
        task: String,
        dependency: String,
        reason: String,
    },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("pre-check '{check}' failed: {reason}")]
    Precheck { check: String, reason: String },

    #[error("run cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled | TaskError::Controller(ControllerError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
