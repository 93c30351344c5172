use thiserror::Error;

/// A convenience `Result` alias using [`EvaError`].
pub type EvaResult<T> = Result<T, EvaError>;

/// Top-level error type for the dispatch subsystems.
#[derive(Error, Debug)]
pub enum EvaError {
    /// A referenced entity (agent, queue item, workflow, dead letter) does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `"queue item"`.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A state change was requested that the entity's state machine forbids.
    #[error("Invalid transition for {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        /// Entity kind, e.g. `"workflow"`.
        kind: &'static str,
        /// Entity identifier.
        id: String,
        /// State the entity is currently in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// No agent can take the task right now (offline, saturated, or below the score floor).
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Caller input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backing queue store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error raised by the workflow tracker.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvaError {
    /// Shorthand for [`EvaError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`EvaError::InvalidTransition`].
    pub fn invalid_transition(
        kind: &'static str,
        id: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            kind,
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether this error reports a rejected state transition.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}
