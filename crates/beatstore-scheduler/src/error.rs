use thiserror::Error;

/// Errors that can occur within the periodic task store.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A schedule field failed validation. Raised before anything is written.
    #[error("Invalid schedule field `{field}`: {reason}")]
    InvalidSchedule { field: &'static str, reason: String },

    /// A task entry field (name, args, kwargs, ...) is malformed.
    #[error("Invalid task field `{field}`: {reason}")]
    InvalidTask { field: &'static str, reason: String },

    /// No task entry with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: i64 },

    /// A schedule row referenced by ID does not exist.
    #[error("{kind} schedule not found: {id}")]
    ScheduleNotFound { kind: &'static str, id: i64 },

    /// The task entry has no interval, crontab or solar schedule linked.
    #[error("{name} has no schedule configured")]
    NoSchedule { name: String },

    /// Another task entry already uses this name.
    #[error("Task name already in use: {name}")]
    DuplicateName { name: String },

    /// The schedule row is still linked from at least one task entry.
    #[error("{kind} schedule {id} is referenced by {tasks} task(s)")]
    ScheduleInUse {
        kind: &'static str,
        id: i64,
        tasks: i64,
    },

    /// args / kwargs could not be encoded or decoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding the connection lock.
    #[error("Connection lock poisoned")]
    LockPoisoned,
}

impl SchedulerError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidSchedule {
            field,
            reason: reason.into(),
        }
    }

    /// True for the typed not-found variants, so callers can tell
    /// "nothing to update" apart from real failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::TaskNotFound { .. } | SchedulerError::ScheduleNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
