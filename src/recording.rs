//! Recording trigger: bridges a successful join to the recorder and closes
//! the loop when the meeting ends.
//!
//! Recording is best effort. A recorder failure never reverts `joined`; the
//! event keeps its join and carries the error in `recording_error`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::collaborators::Recorder;
use crate::error::OrchestratorError;
use crate::store::EventStore;
use crate::types::{JoinStatus, TransitionMetadata};

pub struct RecordingTrigger {
    store: Arc<dyn EventStore>,
    recorder: Arc<dyn Recorder>,
}

impl RecordingTrigger {
    pub fn new(store: Arc<dyn EventStore>, recorder: Arc<dyn Recorder>) -> Self {
        Self { store, recorder }
    }

    /// Start recording for an event that just moved to `joined`.
    ///
    /// Callers invoke this only after winning the `joining -> joined`
    /// transition, so each join starts at most one recording. Returns the
    /// recorder's id, or `None` if recording is off or could not start.
    pub async fn on_joined(&self, event_id: &str) -> Result<Option<String>, OrchestratorError> {
        let event = self
            .store
            .get(event_id)
            .await?
            .ok_or_else(|| OrchestratorError::EventNotFound(event_id.to_string()))?;

        if !event.auto_record_enabled {
            log::debug!("RecordingTrigger: auto-record off for {}", event_id);
            return Ok(None);
        }
        if !event.join_status.has_joined() {
            log::warn!(
                "RecordingTrigger: {} is {}, not starting a recording",
                event_id,
                event.join_status
            );
            return Ok(None);
        }

        match self.recorder.start_recording(&event).await {
            Ok(recording_id) => {
                self.store
                    .attach_recording(event_id, &recording_id, Utc::now())
                    .await?;
                log::info!(
                    "RecordingTrigger: recording {} started for {}",
                    recording_id,
                    event_id
                );
                Ok(Some(recording_id))
            }
            Err(e) => {
                log::warn!(
                    "RecordingTrigger: joined {} but recording failed to start: {}",
                    event_id,
                    e
                );
                self.store
                    .note_recording_failure(event_id, &e.to_string(), Utc::now())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Move a joined event to `completed` and tell the recorder.
    ///
    /// Returns `Ok(false)` if the event was not `joined` any more (already
    /// completed by the other end-detection path).
    pub async fn complete(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let applied = self
            .store
            .update_status(
                event_id,
                JoinStatus::Joined,
                JoinStatus::Completed,
                TransitionMetadata::at(now),
            )
            .await?;

        if !applied {
            log::debug!("RecordingTrigger: {} already left joined", event_id);
            return Ok(false);
        }

        log::info!("RecordingTrigger: {} completed", event_id);
        if let Err(e) = self.recorder.on_meeting_end(event_id).await {
            log::warn!(
                "RecordingTrigger: recorder end notification failed for {}: {}",
                event_id,
                e
            );
        }
        Ok(true)
    }

    /// Fallback end detection: complete every joined event whose
    /// `end_time + buffer` has passed. Returns how many were completed.
    pub async fn sweep_ended(
        &self,
        now: DateTime<Utc>,
        buffer: chrono::Duration,
    ) -> Result<usize, OrchestratorError> {
        let due = self.store.list_due_for_completion(now, buffer).await?;
        let mut completed = 0;
        for event in due {
            match self.complete(&event.id, now).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => log::warn!(
                    "RecordingTrigger: could not complete {}: {}",
                    event.id,
                    e
                ),
            }
        }
        Ok(completed)
    }
}
