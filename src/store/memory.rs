//! In-memory event store.
//!
//! Every operation runs under one `parking_lot` mutex, which gives the same
//! compare-and-set guarantees as the SQLite conditional update. Used by
//! tests and by embedders that keep events elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{apply_transition, transition_record, validate_schedule, EventStore};
use crate::error::OrchestratorError;
use crate::state_machine::validate_transition;
use crate::types::{
    CalendarEvent, EventSource, JoinStatus, SyncedEvent, TransitionMetadata, TransitionRecord,
};

#[derive(Default)]
struct Inner {
    events: HashMap<String, CalendarEvent>,
    history: Vec<TransitionRecord>,
}

#[derive(Default)]
pub struct InMemoryEventStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreUnavailable` until
    /// switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert or overwrite a row verbatim, bypassing all checks.
    pub fn put(&self, event: CalendarEvent) {
        self.inner.lock().events.insert(event.id.clone(), event);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), OrchestratorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(OrchestratorError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn select<F>(&self, mut predicate: F) -> Result<Vec<CalendarEvent>, OrchestratorError>
    where
        F: FnMut(&CalendarEvent) -> bool,
    {
        self.check_available()?;
        let inner = self.inner.lock();
        let mut matches: Vec<CalendarEvent> = inner
            .events
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(matches)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get(&self, event_id: &str) -> Result<Option<CalendarEvent>, OrchestratorError> {
        self.check_available()?;
        Ok(self.inner.lock().events.get(event_id).cloned())
    }

    async fn update_status(
        &self,
        event_id: &str,
        from: JoinStatus,
        to: JoinStatus,
        metadata: TransitionMetadata,
    ) -> Result<bool, OrchestratorError> {
        validate_transition(event_id, from, to)?;
        self.check_available()?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(event) = inner.events.get_mut(event_id) else {
            return Ok(false);
        };
        if event.join_status != from {
            return Ok(false);
        }
        if from == JoinStatus::Pending && to == JoinStatus::Joining && !event.auto_join_enabled {
            return Ok(false);
        }

        apply_transition(event, to, &metadata);
        let record = transition_record(event_id, from, to, &metadata);
        inner.history.push(record);
        Ok(true)
    }

    async fn heartbeat(
        &self,
        event_id: &str,
        attempts: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let Some(event) = inner.events.get_mut(event_id) else {
            return Ok(false);
        };
        if event.join_status != JoinStatus::Joining {
            return Ok(false);
        }
        event.status_changed_at = now;
        event.updated_at = now;
        if let Some(attempts) = attempts {
            event.join_attempts = attempts;
        }
        Ok(true)
    }

    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        lead: chrono::Duration,
        grace: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        self.select(|e| {
            e.join_status == JoinStatus::Pending
                && e.auto_join_enabled
                && e.in_join_window(now, lead, grace)
        })
    }

    async fn list_missed(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        self.select(|e| {
            e.join_status == JoinStatus::Pending
                && e.auto_join_enabled
                && now > e.window_closes_at(grace)
        })
    }

    async fn list_stale_joining(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        self.select(|e| e.join_status == JoinStatus::Joining && e.status_changed_at < cutoff)
    }

    async fn list_due_for_completion(
        &self,
        now: DateTime<Utc>,
        buffer: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        self.select(|e| {
            e.join_status == JoinStatus::Joined
                && e.end_time
                    .checked_add_signed(buffer)
                    .is_some_and(|due| due <= now)
        })
    }

    async fn upsert_synced(
        &self,
        synced: &SyncedEvent,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        validate_schedule(&synced.id, synced.start_time, synced.end_time)?;
        self.check_available()?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.events.get_mut(&synced.id) {
            Some(existing) => {
                existing.title = synced.title.clone();
                existing.start_time = synced.start_time;
                existing.end_time = synced.end_time;
                existing.meeting_link = synced.meeting_link.clone();
                existing.auto_join_enabled = synced.auto_join_enabled;
                existing.auto_record_enabled = synced.auto_record_enabled;
                existing.project_id = synced.project_id.clone();
                existing.updated_at = now;
            }
            None => {
                let event = CalendarEvent {
                    id: synced.id.clone(),
                    user_id: synced.user_id.clone(),
                    title: synced.title.clone(),
                    start_time: synced.start_time,
                    end_time: synced.end_time,
                    meeting_link: synced.meeting_link.clone(),
                    auto_join_enabled: synced.auto_join_enabled,
                    auto_record_enabled: synced.auto_record_enabled,
                    join_status: JoinStatus::Pending,
                    status_changed_at: now,
                    join_attempts: 0,
                    failure_reason: None,
                    last_error: None,
                    recording_id: None,
                    recording_error: None,
                    project_id: synced.project_id.clone(),
                    source: EventSource::Calendar,
                    created_at: now,
                    updated_at: now,
                };
                inner.events.insert(event.id.clone(), event);
            }
        }
        Ok(())
    }

    async fn insert(&self, event: &CalendarEvent) -> Result<(), OrchestratorError> {
        validate_schedule(&event.id, event.start_time, event.end_time)?;
        self.check_available()?;

        let mut inner = self.inner.lock();
        if inner.events.contains_key(&event.id) {
            return Err(OrchestratorError::InvalidEvent(format!(
                "event {} already exists",
                event.id
            )));
        }
        inner.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn set_auto_join(
        &self,
        event_id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        match inner.events.get_mut(event_id) {
            Some(event) => {
                event.auto_join_enabled = enabled;
                event.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attach_recording(
        &self,
        event_id: &str,
        recording_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        match inner.events.get_mut(event_id) {
            Some(event) if event.join_status.has_joined() => {
                event.recording_id = Some(recording_id.to_string());
                event.recording_error = None;
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn note_recording_failure(
        &self,
        event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        match inner.events.get_mut(event_id) {
            Some(event) if event.join_status.has_joined() => {
                event.recording_error = Some(error.to_string());
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn history(&self, event_id: &str) -> Result<Vec<TransitionRecord>, OrchestratorError> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .history
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }
}
