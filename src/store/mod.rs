//! Event store: the only shared mutable resource of the orchestrator.
//!
//! All status mutation goes through [`EventStore::update_status`] (or its
//! claim alias), a single conditional update keyed on the expected prior
//! status. Two workers racing on the same event therefore cannot both win,
//! and a late duplicate callback finds the status already moved and is
//! rejected with `Ok(false)`.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OrchestratorError;
use crate::types::{
    CalendarEvent, JoinStatus, SyncedEvent, TransitionMetadata, TransitionRecord,
};

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get(&self, event_id: &str) -> Result<Option<CalendarEvent>, OrchestratorError>;

    /// Atomically move `event_id` from `from` to `to`.
    ///
    /// - `Err(InvalidTransition)` if the pair is not in the transition table
    /// - `Ok(false)` if the stored status no longer equals `from` (or, for
    ///   `pending -> joining`, auto-join has been switched off)
    /// - `Ok(true)` if this call applied the transition
    async fn update_status(
        &self,
        event_id: &str,
        from: JoinStatus,
        to: JoinStatus,
        metadata: TransitionMetadata,
    ) -> Result<bool, OrchestratorError>;

    /// Exclusive claim: a conditional transition with no extra metadata.
    async fn try_claim(
        &self,
        event_id: &str,
        from: JoinStatus,
        to: JoinStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        self.update_status(event_id, from, to, TransitionMetadata::at(now))
            .await
    }

    /// Liveness mark from the worker holding a `joining` claim.
    ///
    /// Refreshes `status_changed_at` (and `join_attempts` when given) without
    /// a transition, so the dead-man's switch measures time since the last
    /// sign of work rather than time since the claim. `Ok(false)` if the
    /// event is no longer `joining`.
    async fn heartbeat(
        &self,
        event_id: &str,
        attempts: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError>;

    /// Pending, auto-join enabled, and `start - lead <= now <= start + grace`.
    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        lead: chrono::Duration,
        grace: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError>;

    /// Pending, auto-join enabled, and `now > start + grace`.
    async fn list_missed(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError>;

    /// Joining with no claim or heartbeat since before `cutoff`.
    async fn list_stale_joining(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError>;

    /// Joined and `end + buffer <= now`.
    async fn list_due_for_completion(
        &self,
        now: DateTime<Utc>,
        buffer: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError>;

    /// Calendar-sync write path. New rows start `pending`; existing rows only
    /// get their schedule, link, flags and project refreshed.
    async fn upsert_synced(
        &self,
        event: &SyncedEvent,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError>;

    /// Insert a brand-new row (manual-join creation). Fails if the id exists.
    async fn insert(&self, event: &CalendarEvent) -> Result<(), OrchestratorError>;

    async fn set_auto_join(
        &self,
        event_id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError>;

    /// Store the recorder's id. Only applies once the event has joined.
    async fn attach_recording(
        &self,
        event_id: &str,
        recording_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError>;

    /// Mark a joined event as degraded: recording could not start.
    async fn note_recording_failure(
        &self,
        event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError>;

    /// Applied transitions for one event, oldest first.
    async fn history(&self, event_id: &str) -> Result<Vec<TransitionRecord>, OrchestratorError>;
}

/// Reject schedule data the orchestrator can't reason about.
pub(crate) fn validate_schedule(
    event_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(), OrchestratorError> {
    if event_id.trim().is_empty() {
        return Err(OrchestratorError::InvalidEvent("event id is empty".to_string()));
    }
    if start >= end {
        return Err(OrchestratorError::InvalidEvent(format!(
            "event {} starts at or after it ends",
            event_id
        )));
    }
    Ok(())
}

/// Field changes that accompany a transition, shared by both backends.
///
/// A fresh `joining` claim resets attempt bookkeeping; `recording_id` is only
/// accepted on the way into `joined`.
pub(crate) fn apply_transition(
    event: &mut CalendarEvent,
    to: JoinStatus,
    metadata: &TransitionMetadata,
) {
    event.join_status = to;
    event.status_changed_at = metadata.at;
    event.updated_at = metadata.at;

    if to == JoinStatus::Joining {
        event.join_attempts = 0;
        event.failure_reason = None;
        event.last_error = None;
    }
    if let Some(attempts) = metadata.join_attempts {
        event.join_attempts = attempts;
    }
    if let Some(reason) = metadata.failure_reason {
        event.failure_reason = Some(reason);
    }
    if let Some(error) = &metadata.last_error {
        event.last_error = Some(error.clone());
    }
    if to == JoinStatus::Joined {
        if let Some(recording_id) = &metadata.recording_id {
            event.recording_id = Some(recording_id.clone());
        }
    }
}

/// History entry for an applied transition.
pub(crate) fn transition_record(
    event_id: &str,
    from: JoinStatus,
    to: JoinStatus,
    metadata: &TransitionMetadata,
) -> TransitionRecord {
    TransitionRecord {
        event_id: event_id.to_string(),
        from,
        to,
        at: metadata.at,
        reason: metadata
            .failure_reason
            .map(|r| r.as_str().to_string())
            .or_else(|| metadata.last_error.clone()),
    }
}
