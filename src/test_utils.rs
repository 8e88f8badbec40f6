//! Shared fixtures and fakes for unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::collaborators::{Entitlements, MeetingJoiner, Recorder};
use crate::error::OrchestratorError;
use crate::store::sqlite::SqliteEventStore;
use crate::types::{CalendarEvent, EventSource, JoinStatus, SyncedEvent};

/// A pending, auto-join enabled calendar event lasting one hour.
pub fn event_at(id: &str, start: DateTime<Utc>) -> CalendarEvent {
    let created = start - chrono::Duration::days(1);
    CalendarEvent {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        title: format!("Meeting {}", id),
        start_time: start,
        end_time: start + chrono::Duration::hours(1),
        meeting_link: Some(format!("https://meet.example.com/{}", id)),
        auto_join_enabled: true,
        auto_record_enabled: true,
        join_status: JoinStatus::Pending,
        status_changed_at: created,
        join_attempts: 0,
        failure_reason: None,
        last_error: None,
        recording_id: None,
        recording_error: None,
        project_id: None,
        source: EventSource::Calendar,
        created_at: created,
        updated_at: created,
    }
}

/// Calendar-sync payload matching [`event_at`].
pub fn synced_at(id: &str, start: DateTime<Utc>) -> SyncedEvent {
    SyncedEvent {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        title: format!("Meeting {}", id),
        start_time: start,
        end_time: start + chrono::Duration::hours(1),
        meeting_link: Some(format!("https://meet.example.com/{}", id)),
        auto_join_enabled: true,
        auto_record_enabled: true,
        project_id: None,
    }
}

/// Fresh SQLite store in a temp directory that outlives the test.
pub fn test_store() -> SqliteEventStore {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("autojoin_test.db");
    std::mem::forget(dir);
    SqliteEventStore::open_at(path).expect("open test db")
}

/// What a [`ScriptedJoiner`] does on one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    Succeed,
    Transient,
    Reject,
    /// Never answers; only the timeout ends the attempt.
    Hang,
}

/// Meeting bot that plays back a fixed script, then succeeds.
pub struct ScriptedJoiner {
    script: Mutex<VecDeque<JoinStep>>,
    calls: AtomicUsize,
}

impl ScriptedJoiner {
    pub fn new(steps: &[JoinStep]) -> Self {
        Self {
            script: Mutex::new(steps.iter().copied().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeetingJoiner for ScriptedJoiner {
    async fn join(
        &self,
        meeting_link: &str,
        _user_id: &str,
        _timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front().unwrap_or(JoinStep::Succeed);
        match step {
            JoinStep::Succeed => Ok(()),
            JoinStep::Transient => Err(OrchestratorError::JoinTransientFailure(format!(
                "bot busy for {}",
                meeting_link
            ))),
            JoinStep::Reject => Err(OrchestratorError::JoinRejected(format!(
                "meeting {} not found",
                meeting_link
            ))),
            JoinStep::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Recorder that counts calls and hands out `rec-<event id>`.
pub struct CountingRecorder {
    fail: bool,
    starts: AtomicUsize,
    ends: AtomicUsize,
}

impl CountingRecorder {
    pub fn new() -> Self {
        Self {
            fail: false,
            starts: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recorder for CountingRecorder {
    async fn start_recording(&self, event: &CalendarEvent) -> Result<String, OrchestratorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(OrchestratorError::RecordingStartFailure(
                "recorder returned 500".to_string(),
            ));
        }
        Ok(format!("rec-{}", event.id))
    }

    async fn on_meeting_end(&self, _event_id: &str) -> Result<(), OrchestratorError> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Entitlements that refuse a fixed set of users.
pub struct DenyUsers(pub HashSet<String>);

impl DenyUsers {
    pub fn new(users: &[&str]) -> Self {
        Self(users.iter().map(|u| u.to_string()).collect())
    }
}

#[async_trait]
impl Entitlements for DenyUsers {
    async fn can_auto_join(&self, user_id: &str) -> Result<bool, OrchestratorError> {
        Ok(!self.0.contains(user_id))
    }
}
