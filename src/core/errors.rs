use thiserror::Error;

/// Unified error type for the gantry worker core.
#[derive(Debug, Error)]
pub enum GantryError {
    /// A (state, stimulus) pair with no entry in the transition table.
    ///
    /// This is a protocol defect, not a runtime condition: the coordinator
    /// and the worker disagree about what the task is doing. Never absorbed.
    #[error("invalid transition for task {key}: {stimulus} received in state {state}")]
    InvalidTransition {
        key: String,
        state: String,
        stimulus: &'static str,
    },

    /// The resource ledger and the task arena disagree about a reservation.
    #[error("ledger desync for task {key}: {detail}")]
    LedgerDesync { key: String, detail: String },

    /// A task's restrictions name a resource no pool was configured for.
    #[error("unknown resource {resource:?} requested by task {key}")]
    UnknownResource { resource: String, key: String },

    /// The validator found invariant violations in validate mode.
    #[error("{count} invariant violation(s), first: {first}")]
    InvariantViolations { count: usize, first: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Channel/messaging errors between the node and its collaborators.
    #[error("channel closed: {channel}")]
    ChannelClosed { channel: String },

    /// Generic internal errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GantryError {
    pub fn invalid_transition(
        key: impl Into<String>,
        state: impl Into<String>,
        stimulus: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            key: key.into(),
            state: state.into(),
            stimulus,
        }
    }

    pub fn ledger_desync(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::LedgerDesync {
            key: key.into(),
            detail: detail.into(),
        }
    }

    pub fn unknown_resource(resource: impl Into<String>, key: impl Into<String>) -> Self {
        Self::UnknownResource {
            resource: resource.into(),
            key: key.into(),
        }
    }

    pub fn invariant_violations(count: usize, first: impl Into<String>) -> Self {
        Self::InvariantViolations {
            count,
            first: first.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn channel(channel: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: channel.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the condition can be absorbed and retried locally.
    ///
    /// Transition and ledger faults are protocol/logic defects: retrying the
    /// same stimulus would fail identically, so they are fatal to the node.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidTransition { .. } => false,
            Self::LedgerDesync { .. } => false,
            Self::UnknownResource { .. } => false,
            Self::InvariantViolations { .. } => false,
            Self::Configuration { .. } => false,
            Self::ChannelClosed { .. } => true,
            Self::Internal { .. } => false,
        }
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "transition",
            Self::LedgerDesync { .. } => "ledger",
            Self::UnknownResource { .. } => "ledger",
            Self::InvariantViolations { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::ChannelClosed { .. } => "channel",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GantryError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GantryError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::channel("stimulus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = GantryError::invalid_transition("x", "memory", "secede");
        assert_eq!(err.category(), "transition");
        assert!(!err.is_recoverable());

        let err = GantryError::ledger_desync("x", "release without reservation");
        assert_eq!(err.category(), "ledger");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = GantryError::invalid_transition("task-7", "released", "secede-to-long-running");
        let text = err.to_string();
        assert!(text.contains("task-7"));
        assert!(text.contains("released"));
        assert!(text.contains("secede-to-long-running"));
    }

    #[test]
    fn test_configuration_field() {
        let err = GantryError::configuration_field("must be greater than 0", "thread_slots");
        assert!(matches!(
            err,
            GantryError::Configuration { field: Some(_), .. }
        ));
    }
}
