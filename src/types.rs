//! Shared type definitions for the auto-join orchestrator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Join status
// =============================================================================

/// Lifecycle of one event's auto-join attempt.
///
/// Stored as lowercase text; the legal moves between variants live in
/// `state_machine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStatus {
    Pending,
    Joining,
    Joined,
    Failed,
    Completed,
}

impl JoinStatus {
    pub const ALL: [JoinStatus; 5] = [
        JoinStatus::Pending,
        JoinStatus::Joining,
        JoinStatus::Joined,
        JoinStatus::Failed,
        JoinStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStatus::Pending => "pending",
            JoinStatus::Joining => "joining",
            JoinStatus::Joined => "joined",
            JoinStatus::Failed => "failed",
            JoinStatus::Completed => "completed",
        }
    }

    /// True once the bot has been confirmed in the meeting.
    pub fn has_joined(&self) -> bool {
        matches!(self, JoinStatus::Joined | JoinStatus::Completed)
    }
}

impl fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JoinStatus::Pending),
            "joining" => Ok(JoinStatus::Joining),
            "joined" => Ok(JoinStatus::Joined),
            "failed" => Ok(JoinStatus::Failed),
            "completed" => Ok(JoinStatus::Completed),
            other => Err(format!("Unknown join status: {}", other)),
        }
    }
}

// =============================================================================
// Failure reasons
// =============================================================================

/// Categorized reason recorded when an event lands in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// Grace window elapsed before any scheduler claimed the event.
    MissedWindow,
    /// Every join attempt failed transiently.
    JoinExhausted,
    /// The bot service refused the join outright.
    JoinRejected,
    /// Stuck in `joining` past the dead-man's-switch timeout.
    Abandoned,
    NoMeetingLink,
    InvalidMeetingLink,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MissedWindow => "missed-window",
            FailureReason::JoinExhausted => "join-exhausted",
            FailureReason::JoinRejected => "join-rejected",
            FailureReason::Abandoned => "abandoned",
            FailureReason::NoMeetingLink => "no-meeting-link",
            FailureReason::InvalidMeetingLink => "invalid-meeting-link",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missed-window" => Ok(FailureReason::MissedWindow),
            "join-exhausted" => Ok(FailureReason::JoinExhausted),
            "join-rejected" => Ok(FailureReason::JoinRejected),
            "abandoned" => Ok(FailureReason::Abandoned),
            "no-meeting-link" => Ok(FailureReason::NoMeetingLink),
            "invalid-meeting-link" => Ok(FailureReason::InvalidMeetingLink),
            other => Err(format!("Unknown failure reason: {}", other)),
        }
    }
}

// =============================================================================
// Calendar events
// =============================================================================

/// Where an event row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Calendar,
    Manual,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Calendar => "calendar",
            EventSource::Manual => "manual",
        }
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calendar" => Ok(EventSource::Calendar),
            "manual" => Ok(EventSource::Manual),
            other => Err(format!("Unknown event source: {}", other)),
        }
    }
}

/// A calendar event together with its auto-join configuration and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_link: Option<String>,
    pub auto_join_enabled: bool,
    pub auto_record_enabled: bool,
    pub join_status: JoinStatus,
    /// When `join_status` last changed. Drives the dead-man's switch.
    pub status_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub join_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Weak reference to the recording entity. Lookup only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    /// Set when the join succeeded but recording could not start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub source: EventSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalendarEvent {
    /// Earliest instant a join may be dispatched. Saturates at the clock's
    /// range.
    pub fn window_opens_at(&self, lead: chrono::Duration) -> DateTime<Utc> {
        self.start_time
            .checked_sub_signed(lead)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Last instant an unclaimed event may still be claimed.
    pub fn window_closes_at(&self, grace: chrono::Duration) -> DateTime<Utc> {
        self.start_time
            .checked_add_signed(grace)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn in_join_window(
        &self,
        now: DateTime<Utc>,
        lead: chrono::Duration,
        grace: chrono::Duration,
    ) -> bool {
        now >= self.window_opens_at(lead) && now <= self.window_closes_at(grace)
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_time < now
    }
}

/// Row shape the calendar-sync collaborator writes.
///
/// Sync never supplies status, attempt or recording fields: those belong to
/// the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedEvent {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub meeting_link: Option<String>,
    #[serde(default)]
    pub auto_join_enabled: bool,
    #[serde(default)]
    pub auto_record_enabled: bool,
    #[serde(default)]
    pub project_id: Option<String>,
}

/// A user asking the bot to join a specific meeting link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualJoinRequest {
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    pub meeting_link: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub project_id: Option<String>,
}

// =============================================================================
// Transitions
// =============================================================================

/// Extra fields written atomically with a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMetadata {
    pub at: DateTime<Utc>,
    pub failure_reason: Option<FailureReason>,
    pub last_error: Option<String>,
    pub join_attempts: Option<u32>,
    pub recording_id: Option<String>,
}

impl TransitionMetadata {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            failure_reason: None,
            last_error: None,
            join_attempts: None,
            recording_id: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason),
            last_error: Some(error.into()),
            ..Self::at(at)
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.join_attempts = Some(attempts);
        self
    }

    pub fn with_recording_id(mut self, recording_id: impl Into<String>) -> Self {
        self.recording_id = Some(recording_id.into());
        self
    }
}

/// One applied status change, kept as history per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub event_id: String,
    pub from: JoinStatus,
    pub to: JoinStatus,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// =============================================================================
// Join tasks
// =============================================================================

/// What caused a join to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinTrigger {
    Scheduled,
    Manual,
}

/// Message sent from a claimer to the join executor.
#[derive(Debug, Clone)]
pub struct JoinTask {
    pub event_id: String,
    pub trigger: JoinTrigger,
    pub claimed_at: DateTime<Utc>,
}

/// Fixed-width RFC 3339 UTC rendering at full nanosecond precision, so stored
/// timestamps sort lexically and read back unchanged.
pub fn to_db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
