//! Join status state machine.
//!
//! ```text
//! pending ──claim──▶ joining ──bot confirms──▶ joined ──meeting ends──▶ completed
//!    │                  │  ▲
//!    │ grace elapsed    │  │ manual re-trigger
//!    ▼                  ▼  │
//!  failed ◀──retries exhausted / abandoned
//! ```
//!
//! Every store mutation of `join_status` is checked against this table before
//! it reaches the conditional update, so out-of-order callbacks can't move an
//! event backwards.

use crate::error::OrchestratorError;
use crate::types::JoinStatus;

/// Legal (from, to) pairs.
const TRANSITIONS: &[(JoinStatus, JoinStatus)] = &[
    (JoinStatus::Pending, JoinStatus::Joining),
    (JoinStatus::Joining, JoinStatus::Joined),
    (JoinStatus::Joining, JoinStatus::Failed),
    (JoinStatus::Joined, JoinStatus::Completed),
    (JoinStatus::Failed, JoinStatus::Joining),
    (JoinStatus::Pending, JoinStatus::Failed),
];

pub fn is_legal(from: JoinStatus, to: JoinStatus) -> bool {
    TRANSITIONS.contains(&(from, to))
}

/// Reject a transition that is not in the table.
pub fn validate_transition(
    event_id: &str,
    from: JoinStatus,
    to: JoinStatus,
) -> Result<(), OrchestratorError> {
    if is_legal(from, to) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidTransition {
            event_id: event_id.to_string(),
            from,
            to,
        })
    }
}
