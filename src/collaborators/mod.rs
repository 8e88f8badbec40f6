//! External collaborators the orchestrator drives but does not own.
//!
//! The bot service, the recorder and the entitlement check all sit behind
//! traits so the core can run against fakes in tests and against the HTTP
//! clients in [`http`] in production.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::OrchestratorError;
use crate::types::CalendarEvent;

/// Dispatches the meeting bot into a call.
///
/// Implementations classify failures:
/// - `JoinTransientFailure`: network error, 5xx, bot busy. The executor retries.
/// - `JoinRejected`: the service refused this link for good. No retries.
#[async_trait]
pub trait MeetingJoiner: Send + Sync {
    /// Join within `timeout`. The executor also enforces the bound.
    async fn join(
        &self,
        meeting_link: &str,
        user_id: &str,
        timeout: Duration,
    ) -> Result<(), OrchestratorError>;
}

/// Starts and stops recordings for joined meetings.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Begin recording. Returns the recorder's id for the new recording.
    async fn start_recording(&self, event: &CalendarEvent) -> Result<String, OrchestratorError>;

    /// The meeting is over; finalize whatever the recorder has for it.
    async fn on_meeting_end(&self, event_id: &str) -> Result<(), OrchestratorError>;
}

/// Plan/billing gate consulted before a scheduled claim.
#[async_trait]
pub trait Entitlements: Send + Sync {
    async fn can_auto_join(&self, user_id: &str) -> Result<bool, OrchestratorError>;
}

/// Entitlement check that admits everyone.
pub struct AllowAll;

#[async_trait]
impl Entitlements for AllowAll {
    async fn can_auto_join(&self, _user_id: &str) -> Result<bool, OrchestratorError> {
        Ok(true)
    }
}

/// Validate a meeting link before spending attempts on it.
///
/// Only absolute http(s) URLs with a host are accepted.
pub fn validate_meeting_link(link: &str) -> Result<url::Url, String> {
    let parsed = url::Url::parse(link.trim()).map_err(|e| format!("{}: {}", link, e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{}'", other)),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(format!("{} has no host", link));
    }
    Ok(parsed)
}
