//! Error types for the auto-join orchestrator
//!
//! Errors are classified by how the core reacts to them:
//! - Retryable: transient bot failures, store outages (next attempt / next tick)
//! - Expected under concurrency: lost claims, stale callbacks (skipped quietly)
//! - Terminal: recorded on the event as a failure reason, never thrown to a user

use thiserror::Error;

use crate::types::JoinStatus;

/// Error types for orchestration
#[derive(Debug, Error)]
pub enum OrchestratorError {
    // Expected under concurrency
    #[error("Event {0} was already claimed by another worker")]
    ClaimConflict(String),

    #[error("Invalid transition for event {event_id}: {from} -> {to}")]
    InvalidTransition {
        event_id: String,
        from: JoinStatus,
        to: JoinStatus,
    },

    // Retryable errors
    #[error("Join attempt failed: {0}")]
    JoinTransientFailure(String),

    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    // Terminal outcomes
    #[error("Event {0} passed its join window unclaimed")]
    MissedWindow(String),

    #[error("Join rejected by meeting bot: {0}")]
    JoinRejected(String),

    #[error("Join failed after {attempts} attempts: {last_error}")]
    JoinExhausted { attempts: u32, last_error: String },

    #[error("Recording failed to start: {0}")]
    RecordingStartFailure(String),

    // Caller errors
    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("User {user_id} does not own event {event_id}")]
    Forbidden { event_id: String, user_id: String },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl OrchestratorError {
    /// Returns true if the operation should be attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::JoinTransientFailure(_) | OrchestratorError::StoreUnavailable(_)
        )
    }

    /// Returns true for races between workers or duplicate callbacks.
    ///
    /// These are normal under horizontal scaling and must not be logged at
    /// error severity.
    pub fn is_expected_under_concurrency(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ClaimConflict(_) | OrchestratorError::InvalidTransition { .. }
        )
    }
}

impl From<crate::store::sqlite::DbError> for OrchestratorError {
    fn from(err: crate::store::sqlite::DbError) -> Self {
        OrchestratorError::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_and_store_errors_are_retryable() {
        assert!(OrchestratorError::JoinTransientFailure("503".into()).is_retryable());
        assert!(OrchestratorError::StoreUnavailable("locked".into()).is_retryable());
        assert!(!OrchestratorError::JoinRejected("404".into()).is_retryable());
        assert!(!OrchestratorError::JoinExhausted {
            attempts: 3,
            last_error: "timeout".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_races_are_expected_not_failures() {
        assert!(OrchestratorError::ClaimConflict("evt".into()).is_expected_under_concurrency());
        assert!(OrchestratorError::InvalidTransition {
            event_id: "evt".into(),
            from: JoinStatus::Completed,
            to: JoinStatus::Joining,
        }
        .is_expected_under_concurrency());
        assert!(!OrchestratorError::MissedWindow("evt".into()).is_expected_under_concurrency());
    }

    #[test]
    fn test_exhausted_message_keeps_last_reason() {
        let err = OrchestratorError::JoinExhausted {
            attempts: 3,
            last_error: "bot unreachable".into(),
        };
        assert_eq!(err.to_string(), "Join failed after 3 attempts: bot unreachable");
    }
}
