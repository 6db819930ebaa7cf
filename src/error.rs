//! Crate-level error type.
//!
//! Every fallible operation in the engine returns [`Result`]. Configuration
//! problems are rejected before anything is stored; storage failures are
//! wrapped so callers see one error type regardless of backend.

use crate::model::TestStatus;

/// Errors surfaced by the experimentation engine.
#[derive(Debug, thiserror::Error)]
pub enum AbTestError {
    #[error("test not found: {0}")]
    TestNotFound(String),

    #[error("test {0} is not currently running")]
    TestNotRunning(String),

    #[error("cannot {action} a test in status '{from}'")]
    InvalidTransition { from: TestStatus, action: &'static str },

    #[error("invalid variant configuration: {0}")]
    InvalidVariantConfiguration(String),

    #[error("confidence level must be one of 90, 95 or 99, got {0}")]
    InvalidConfidenceLevel(u8),

    #[error("invalid test configuration: {0}")]
    InvalidConfiguration(String),

    #[error("participant does not match the target audience of test {0}")]
    AudienceMismatch(String),

    #[error("participant {participant_id} is not enrolled in test {test_id}")]
    ParticipantNotFound { test_id: String, participant_id: String },

    #[error("unknown test template: {0}")]
    TemplateNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for AbTestError {
    fn from(e: rusqlite::Error) -> Self {
        AbTestError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AbTestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message_names_state_and_action() {
        let e = AbTestError::InvalidTransition { from: TestStatus::Running, action: "start" };
        assert_eq!(e.to_string(), "cannot start a test in status 'running'");
    }

    #[test]
    fn test_rusqlite_error_maps_to_storage() {
        let e: AbTestError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, AbTestError::Storage(_)));
    }

    #[test]
    fn test_participant_not_found_message() {
        let e = AbTestError::ParticipantNotFound {
            test_id: "t1".into(),
            participant_id: "u1".into(),
        };
        assert!(e.to_string().contains("u1"));
        assert!(e.to_string().contains("t1"));
    }
}
