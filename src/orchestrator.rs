//! Orchestrator: wires the scheduler, executor and recording trigger around
//! one event store, and exposes the user-facing entry points (manual
//! re-trigger, cancel, manual join, end signal, calendar-sync ingest).

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::collaborators::{Entitlements, MeetingJoiner, Recorder};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::executor::JoinExecutor;
use crate::recording::RecordingTrigger;
use crate::scheduler::TriggerScheduler;
use crate::store::EventStore;
use crate::types::{
    CalendarEvent, EventSource, JoinStatus, JoinTask, JoinTrigger, ManualJoinRequest,
    SyncedEvent, TransitionRecord,
};

pub struct Orchestrator {
    store: Arc<dyn EventStore>,
    scheduler: Arc<TriggerScheduler>,
    executor: Arc<JoinExecutor>,
    recording: Arc<RecordingTrigger>,
    sender: mpsc::UnboundedSender<JoinTask>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<JoinTask>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn EventStore>,
        joiner: Arc<dyn MeetingJoiner>,
        recorder: Arc<dyn Recorder>,
        entitlements: Arc<dyn Entitlements>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let recording = Arc::new(RecordingTrigger::new(Arc::clone(&store), recorder));
        let executor = Arc::new(JoinExecutor::new(
            Arc::clone(&store),
            joiner,
            Arc::clone(&recording),
            config.retry_policy(),
            config.join_worker_pool_size,
        ));
        let scheduler = Arc::new(TriggerScheduler::new(
            Arc::clone(&store),
            entitlements,
            Arc::clone(&recording),
            sender.clone(),
            config,
        ));

        Self {
            store,
            scheduler,
            executor,
            recording,
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn scheduler(&self) -> &TriggerScheduler {
        &self.scheduler
    }

    /// Run scheduler and executor until `shutdown` flips to true.
    ///
    /// The executor gets to finish (or time out) its in-flight joins before
    /// this returns. Can only be called once per orchestrator.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), OrchestratorError> {
        let receiver = self.receiver.lock().take().ok_or_else(|| {
            OrchestratorError::ConfigurationError("orchestrator is already running".to_string())
        })?;

        let executor = tokio::spawn(Arc::clone(&self.executor).run(receiver, shutdown.clone()));
        self.scheduler.run(shutdown).await;

        if let Err(e) = executor.await {
            log::error!("Orchestrator: executor task failed: {}", e);
        }
        log::info!("Orchestrator: stopped");
        Ok(())
    }

    pub async fn event(&self, event_id: &str) -> Result<Option<CalendarEvent>, OrchestratorError> {
        self.store.get(event_id).await
    }

    pub async fn history(
        &self,
        event_id: &str,
    ) -> Result<Vec<TransitionRecord>, OrchestratorError> {
        self.store.history(event_id).await
    }

    /// Load an event and check that `user_id` owns it.
    async fn owned_event(
        &self,
        event_id: &str,
        user_id: &str,
    ) -> Result<CalendarEvent, OrchestratorError> {
        let event = self
            .store
            .get(event_id)
            .await?
            .ok_or_else(|| OrchestratorError::EventNotFound(event_id.to_string()))?;
        if event.user_id != user_id {
            return Err(OrchestratorError::Forbidden {
                event_id: event_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(event)
    }

    /// User-initiated retry of a failed event.
    ///
    /// Same claim discipline as the scheduler: a conditional
    /// `failed -> joining` update, and only the winner dispatches.
    pub async fn retrigger(&self, event_id: &str, user_id: &str) -> Result<(), OrchestratorError> {
        let event = self.owned_event(event_id, user_id).await?;
        let now = Utc::now();

        if event.join_status != JoinStatus::Failed {
            return Err(OrchestratorError::InvalidTransition {
                event_id: event_id.to_string(),
                from: event.join_status,
                to: JoinStatus::Joining,
            });
        }
        if event.has_ended(now) {
            return Err(OrchestratorError::MissedWindow(event_id.to_string()));
        }

        let claimed = self
            .store
            .try_claim(event_id, JoinStatus::Failed, JoinStatus::Joining, now)
            .await?;
        if !claimed {
            log::debug!("Orchestrator: manual retry of {} lost the claim", event_id);
            return Err(OrchestratorError::ClaimConflict(event_id.to_string()));
        }

        log::info!("Orchestrator: manual retry of {} by {}", event_id, user_id);
        self.dispatch(event_id, JoinTrigger::Manual, now);
        Ok(())
    }

    fn dispatch(&self, event_id: &str, trigger: JoinTrigger, claimed_at: chrono::DateTime<Utc>) {
        let task = JoinTask {
            event_id: event_id.to_string(),
            trigger,
            claimed_at,
        };
        if self.sender.send(task).is_err() {
            log::error!(
                "Orchestrator: join queue closed, {} stays joining without a worker",
                event_id
            );
        }
    }

    /// Turn auto-join off. An attempt already in flight is not interrupted.
    pub async fn cancel_auto_join(
        &self,
        event_id: &str,
        user_id: &str,
    ) -> Result<(), OrchestratorError> {
        self.set_auto_join(event_id, user_id, false).await
    }

    pub async fn set_auto_join(
        &self,
        event_id: &str,
        user_id: &str,
        enabled: bool,
    ) -> Result<(), OrchestratorError> {
        self.owned_event(event_id, user_id).await?;
        if !self.store.set_auto_join(event_id, enabled, Utc::now()).await? {
            return Err(OrchestratorError::EventNotFound(event_id.to_string()));
        }
        log::info!(
            "Orchestrator: auto-join {} for {}",
            if enabled { "enabled" } else { "cancelled" },
            event_id
        );
        Ok(())
    }

    /// Create a one-off event for a pasted meeting link. The scheduler picks
    /// it up like any calendar event once its window opens.
    pub async fn create_manual_join(
        &self,
        request: ManualJoinRequest,
    ) -> Result<CalendarEvent, OrchestratorError> {
        if request.user_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidEvent("user id is empty".to_string()));
        }
        crate::collaborators::validate_meeting_link(&request.meeting_link)
            .map_err(|e| OrchestratorError::InvalidEvent(format!("meeting link: {}", e)))?;

        let now = Utc::now();
        let event = CalendarEvent {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: request.user_id,
            title: request.title,
            start_time: request.start_time,
            end_time: request.end_time,
            meeting_link: Some(request.meeting_link.trim().to_string()),
            auto_join_enabled: true,
            auto_record_enabled: true,
            join_status: JoinStatus::Pending,
            status_changed_at: now,
            join_attempts: 0,
            failure_reason: None,
            last_error: None,
            recording_id: None,
            recording_error: None,
            project_id: request.project_id,
            source: EventSource::Manual,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&event).await?;
        log::info!(
            "Orchestrator: manual join {} created for {}",
            event.id,
            event.user_id
        );
        Ok(event)
    }

    /// Calendar-sync write path. Returns how many rows were written.
    pub async fn ingest_synced(&self, events: &[SyncedEvent]) -> Result<usize, OrchestratorError> {
        let now = Utc::now();
        let mut written = 0;
        for event in events {
            match self.store.upsert_synced(event, now).await {
                Ok(()) => written += 1,
                Err(OrchestratorError::InvalidEvent(reason)) => {
                    log::warn!("Orchestrator: skipping synced event: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Explicit end-of-meeting signal from the meeting provider.
    pub async fn signal_meeting_end(
        &self,
        event_id: &str,
        user_id: &str,
    ) -> Result<(), OrchestratorError> {
        let event = self.owned_event(event_id, user_id).await?;
        if self.recording.complete(event_id, Utc::now()).await? {
            return Ok(());
        }
        let err = OrchestratorError::InvalidTransition {
            event_id: event_id.to_string(),
            from: event.join_status,
            to: JoinStatus::Completed,
        };
        log::warn!("Orchestrator: end signal rejected: {}", err);
        Err(err)
    }
}
