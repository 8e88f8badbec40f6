//! Join executor: performs the external join for claimed events.
//!
//! Receives [`JoinTask`]s from the scheduler (and manual re-triggers) over an
//! mpsc channel. Each task runs on its own tokio task; a semaphore caps how
//! many joins talk to the bot service at once. Tasks beyond the cap wait for
//! a permit while their events keep the `joining` claim.
//!
//! A live worker heartbeats its claim: periodically while queued, when it
//! starts, and around every attempt. The scheduler's dead-man's switch only
//! fails events whose heartbeat went quiet, i.e. whose worker died.
//!
//! Per event: up to `max_attempts` calls, each bounded by the attempt
//! timeout, with exponential backoff in between. The outcome is written with
//! a conditional `joining -> joined|failed` update, so a result that arrives
//! after the dead-man's switch already failed the event is dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::collaborators::{validate_meeting_link, MeetingJoiner};
use crate::error::OrchestratorError;
use crate::recording::RecordingTrigger;
use crate::retry::RetryPolicy;
use crate::store::EventStore;
use crate::types::{FailureReason, JoinStatus, JoinTask, TransitionMetadata};

/// How one task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined {
        attempts: u32,
        recording_id: Option<String>,
    },
    Failed {
        attempts: u32,
        reason: FailureReason,
    },
    /// The event was no longer `joining` when the task started.
    Skipped,
    /// Someone else moved the event while we were working on it.
    Superseded,
}

enum AttemptResult {
    Success(u32),
    Failure {
        attempts: u32,
        reason: FailureReason,
        error: String,
    },
    Superseded,
}

pub struct JoinExecutor {
    store: Arc<dyn EventStore>,
    joiner: Arc<dyn MeetingJoiner>,
    recording: Arc<RecordingTrigger>,
    policy: RetryPolicy,
    pool_size: usize,
}

impl JoinExecutor {
    pub fn new(
        store: Arc<dyn EventStore>,
        joiner: Arc<dyn MeetingJoiner>,
        recording: Arc<RecordingTrigger>,
        policy: RetryPolicy,
        pool_size: usize,
    ) -> Self {
        Self {
            store,
            joiner,
            recording,
            policy,
            pool_size: pool_size.max(1),
        }
    }

    /// Consume join tasks until the channel closes or shutdown is signalled,
    /// then wait for in-flight joins to finish or hit their timeouts.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<JoinTask>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(self.pool_size));
        let mut workers = JoinSet::new();
        log::info!("Executor: started with {} join workers", self.pool_size);

        loop {
            tokio::select! {
                maybe_task = receiver.recv() => {
                    let Some(task) = maybe_task else {
                        log::info!("Executor: join queue closed");
                        break;
                    };
                    let executor = Arc::clone(&self);
                    let permits = Arc::clone(&permits);
                    workers.spawn(async move {
                        let Some(_permit) = executor.wait_for_worker(&task, permits).await else {
                            return;
                        };
                        executor.handle(task).await;
                    });
                }
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Executor: join worker panicked: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    log::info!("Executor: shutdown requested");
                    break;
                }
            }
        }

        if !workers.is_empty() {
            log::info!("Executor: draining {} in-flight joins", workers.len());
        }
        while let Some(finished) = workers.join_next().await {
            if let Err(e) = finished {
                log::error!("Executor: join worker panicked: {}", e);
            }
        }
        log::info!("Executor: stopped");
    }

    /// Wait for a free worker, keeping the queued claim alive meanwhile.
    async fn wait_for_worker(
        &self,
        task: &JoinTask,
        permits: Arc<Semaphore>,
    ) -> Option<OwnedSemaphorePermit> {
        let period = self.keepalive_period();
        let acquire = permits.acquire_owned();
        tokio::pin!(acquire);
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                permit = &mut acquire => return permit.ok(),
                _ = keepalive.tick() => {
                    match self.store.heartbeat(&task.event_id, None, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            log::debug!(
                                "Executor: {} left joining while queued",
                                task.event_id
                            );
                            return None;
                        }
                        Err(e) => log::warn!(
                            "Executor: heartbeat for queued {} failed: {}",
                            task.event_id,
                            e
                        ),
                    }
                }
            }
        }
    }

    /// A running worker is never quiet longer than one attempt timeout or one
    /// backoff; queued tasks beat at the attempt timeout.
    fn keepalive_period(&self) -> Duration {
        self.policy
            .attempt_timeout
            .clamp(Duration::from_secs(1), Duration::from_secs(60 * 60))
    }

    async fn handle(&self, task: JoinTask) {
        match self.execute(&task).await {
            Ok(outcome) => log::debug!("Executor: {} -> {:?}", task.event_id, outcome),
            Err(e) if e.is_expected_under_concurrency() => {
                log::warn!("Executor: {} skipped: {}", task.event_id, e)
            }
            Err(e) => log::warn!(
                "Executor: {} left for the dead-man's switch: {}",
                task.event_id,
                e
            ),
        }
    }

    /// Run one claimed event through the join attempts and record the result.
    pub async fn execute(&self, task: &JoinTask) -> Result<JoinOutcome, OrchestratorError> {
        let Some(event) = self.store.get(&task.event_id).await? else {
            log::warn!("Executor: event {} vanished after claim", task.event_id);
            return Ok(JoinOutcome::Skipped);
        };
        if event.join_status != JoinStatus::Joining {
            log::debug!(
                "Executor: {} is {}, not joining; skipping",
                event.id,
                event.join_status
            );
            return Ok(JoinOutcome::Skipped);
        }
        if !self.store.heartbeat(&event.id, None, Utc::now()).await? {
            log::debug!("Executor: {} left joining before its worker started", event.id);
            return Ok(JoinOutcome::Skipped);
        }

        log::info!(
            "Executor: joining {} ({:?}, claimed {})",
            event.id,
            task.trigger,
            task.claimed_at
        );

        let result = match event.meeting_link.as_deref() {
            None => AttemptResult::Failure {
                attempts: 0,
                reason: FailureReason::NoMeetingLink,
                error: "event has no meeting link".to_string(),
            },
            Some(link) => match validate_meeting_link(link) {
                Err(e) => AttemptResult::Failure {
                    attempts: 0,
                    reason: FailureReason::InvalidMeetingLink,
                    error: e,
                },
                Ok(_) => self.attempt_join(&event.id, link.trim(), &event.user_id).await?,
            },
        };

        match result {
            AttemptResult::Success(attempts) => self.finish_joined(&event.id, attempts).await,
            AttemptResult::Failure {
                attempts,
                reason,
                error,
            } => self.finish_failed(&event.id, attempts, reason, error).await,
            AttemptResult::Superseded => Ok(JoinOutcome::Superseded),
        }
    }

    async fn attempt_join(
        &self,
        event_id: &str,
        link: &str,
        user_id: &str,
    ) -> Result<AttemptResult, OrchestratorError> {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            let call = self.joiner.join(link, user_id, self.policy.attempt_timeout);
            let error = match tokio::time::timeout(self.policy.attempt_timeout, call).await {
                Ok(Ok(())) => {
                    log::info!("Executor: {} joined on attempt {}", event_id, attempt);
                    return Ok(AttemptResult::Success(attempt));
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    log::warn!("Executor: bot refused {}: {}", event_id, e);
                    return Ok(AttemptResult::Failure {
                        attempts: attempt,
                        reason: FailureReason::JoinRejected,
                        error: e.to_string(),
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "join attempt timed out after {}s",
                    self.policy.attempt_timeout.as_secs_f64()
                ),
            };

            log::info!(
                "Executor: attempt {}/{} for {} failed: {}",
                attempt,
                self.policy.max_attempts,
                event_id,
                error
            );
            last_error = error;

            if !self.policy.should_retry(attempt) {
                break;
            }

            // Record progress, then check again after the backoff: the
            // dead-man's switch or a retrigger race may have moved the event
            if !self.store.heartbeat(event_id, Some(attempt), Utc::now()).await? {
                log::info!("Executor: {} no longer joining, abandoning retries", event_id);
                return Ok(AttemptResult::Superseded);
            }
            tokio::time::sleep(self.policy.delay_after(attempt)).await;
            if !self.store.heartbeat(event_id, Some(attempt), Utc::now()).await? {
                log::info!("Executor: {} no longer joining, abandoning retries", event_id);
                return Ok(AttemptResult::Superseded);
            }
        }

        let attempts = self.policy.max_attempts;
        Ok(AttemptResult::Failure {
            attempts,
            reason: FailureReason::JoinExhausted,
            error: OrchestratorError::JoinExhausted {
                attempts,
                last_error,
            }
            .to_string(),
        })
    }

    async fn finish_joined(
        &self,
        event_id: &str,
        attempts: u32,
    ) -> Result<JoinOutcome, OrchestratorError> {
        // Reserve the recording slot; the recorder's real id replaces it.
        let reservation = uuid::Uuid::new_v4().to_string();
        let applied = self
            .store
            .update_status(
                event_id,
                JoinStatus::Joining,
                JoinStatus::Joined,
                TransitionMetadata::at(Utc::now())
                    .with_attempts(attempts)
                    .with_recording_id(reservation),
            )
            .await?;

        if !applied {
            log::warn!(
                "Executor: late join result for {}; event already left joining",
                event_id
            );
            return Ok(JoinOutcome::Superseded);
        }

        let recording_id = match self.recording.on_joined(event_id).await {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Executor: recording hand-off failed for {}: {}", event_id, e);
                None
            }
        };

        Ok(JoinOutcome::Joined {
            attempts,
            recording_id,
        })
    }

    async fn finish_failed(
        &self,
        event_id: &str,
        attempts: u32,
        reason: FailureReason,
        error: String,
    ) -> Result<JoinOutcome, OrchestratorError> {
        let applied = self
            .store
            .update_status(
                event_id,
                JoinStatus::Joining,
                JoinStatus::Failed,
                TransitionMetadata::failed(Utc::now(), reason, error.clone())
                    .with_attempts(attempts),
            )
            .await?;

        if !applied {
            log::warn!(
                "Executor: late failure for {}; event already left joining",
                event_id
            );
            return Ok(JoinOutcome::Superseded);
        }

        log::warn!(
            "Executor: {} failed after {} attempts ({}): {}",
            event_id,
            attempts,
            reason,
            error
        );
        Ok(JoinOutcome::Failed { attempts, reason })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::store::memory::InMemoryEventStore;
    use crate::test_utils::{event_at, CountingRecorder, JoinStep, ScriptedJoiner};
    use crate::types::{CalendarEvent, JoinTrigger};

    struct Harness {
        store: Arc<InMemoryEventStore>,
        joiner: Arc<ScriptedJoiner>,
        recorder: Arc<CountingRecorder>,
        executor: Arc<JoinExecutor>,
    }

    fn harness(steps: &[JoinStep], pool_size: usize) -> Harness {
        let store = Arc::new(InMemoryEventStore::new());
        let joiner = Arc::new(ScriptedJoiner::new(steps));
        let recorder = Arc::new(CountingRecorder::new());
        let recording = Arc::new(RecordingTrigger::new(store.clone(), recorder.clone()));
        let executor = Arc::new(JoinExecutor::new(
            store.clone(),
            joiner.clone(),
            recording,
            RetryPolicy::default(),
            pool_size,
        ));
        Harness {
            store,
            joiner,
            recorder,
            executor,
        }
    }

    fn joining_event(id: &str) -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap();
        let mut event = event_at(id, start);
        event.join_status = JoinStatus::Joining;
        event
    }

    fn task(id: &str) -> JoinTask {
        JoinTask {
            event_id: id.to_string(),
            trigger: JoinTrigger::Scheduled,
            claimed_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_second_attempt_records_once() {
        let h = harness(&[JoinStep::Transient, JoinStep::Succeed], 2);
        h.store.put(joining_event("evt-1"));

        let outcome = h.executor.execute(&task("evt-1")).await.unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                attempts: 2,
                recording_id: Some("rec-evt-1".to_string()),
            }
        );
        assert_eq!(h.joiner.calls(), 2);
        assert_eq!(h.recorder.starts(), 1);

        let stored = h.store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(stored.join_status, JoinStatus::Joined);
        assert_eq!(stored.join_attempts, 2);
        assert_eq!(stored.recording_id.as_deref(), Some("rec-evt-1"));

        // A duplicate task finds the event already joined
        let again = h.executor.execute(&task("evt-1")).await.unwrap();
        assert_eq!(again, JoinOutcome::Skipped);
        assert_eq!(h.recorder.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_transient_failures_exhaust() {
        let h = harness(&[JoinStep::Transient; 3], 2);
        h.store.put(joining_event("evt-1"));

        let outcome = h.executor.execute(&task("evt-1")).await.unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Failed {
                attempts: 3,
                reason: FailureReason::JoinExhausted,
            }
        );
        assert_eq!(h.joiner.calls(), 3);
        assert_eq!(h.recorder.starts(), 0);

        let stored = h.store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(stored.join_status, JoinStatus::Failed);
        assert_eq!(stored.failure_reason, Some(FailureReason::JoinExhausted));
        let last_error = stored.last_error.as_deref().unwrap_or_default();
        assert!(last_error.starts_with("Join failed after 3 attempts"));
        assert!(last_error.contains("bot busy"));
        assert!(stored.recording_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let h = harness(&[JoinStep::Transient, JoinStep::Transient, JoinStep::Succeed], 1);
        h.store.put(joining_event("evt-1"));

        let started = tokio::time::Instant::now();
        h.executor.execute(&task("evt-1")).await.unwrap();
        // 5s after attempt 1, 10s after attempt 2
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempts_time_out() {
        let h = harness(&[JoinStep::Hang, JoinStep::Succeed], 1);
        h.store.put(joining_event("evt-1"));

        let started = tokio::time::Instant::now();
        let outcome = h.executor.execute(&task("evt-1")).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Joined { attempts: 2, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_skips_retries() {
        let h = harness(&[JoinStep::Reject], 1);
        h.store.put(joining_event("evt-1"));

        let outcome = h.executor.execute(&task("evt-1")).await.unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Failed {
                attempts: 1,
                reason: FailureReason::JoinRejected,
            }
        );
        assert_eq!(h.joiner.calls(), 1);
    }

    #[tokio::test]
    async fn test_bad_links_fail_without_calling_bot() {
        let h = harness(&[], 1);
        let mut missing = joining_event("no-link");
        missing.meeting_link = None;
        h.store.put(missing);
        let mut garbage = joining_event("bad-link");
        garbage.meeting_link = Some("call me maybe".to_string());
        h.store.put(garbage);

        let outcome = h.executor.execute(&task("no-link")).await.unwrap();
        assert!(matches!(
            outcome,
            JoinOutcome::Failed {
                reason: FailureReason::NoMeetingLink,
                ..
            }
        ));
        let outcome = h.executor.execute(&task("bad-link")).await.unwrap();
        assert!(matches!(
            outcome,
            JoinOutcome::Failed {
                reason: FailureReason::InvalidMeetingLink,
                ..
            }
        ));
        assert_eq!(h.joiner.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_when_event_leaves_joining() {
        let h = harness(&[JoinStep::Transient; 3], 1);
        h.store.put(joining_event("evt-1"));

        let store = h.store.clone();
        let executor = h.executor.clone();
        let run = tokio::spawn(async move { executor.execute(&task("evt-1")).await });

        // Dead-man's switch fires during the first backoff
        tokio::time::sleep(Duration::from_secs(1)).await;
        store
            .update_status(
                "evt-1",
                JoinStatus::Joining,
                JoinStatus::Failed,
                TransitionMetadata::failed(Utc::now(), FailureReason::Abandoned, "stuck"),
            )
            .await
            .unwrap();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, JoinOutcome::Superseded);
        assert_eq!(h.joiner.calls(), 1);
        let stored = h.store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(stored.failure_reason, Some(FailureReason::Abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_claims_stay_alive_behind_a_busy_worker() {
        let h = harness(&[JoinStep::Hang; 9], 1);
        // Claimed long enough ago that only a heartbeat keeps them off the
        // dead-man sweep
        for id in ["a", "b", "c"] {
            let mut event = joining_event(id);
            event.status_changed_at = Utc::now() - chrono::Duration::seconds(300);
            h.store.put(event);
        }
        let dead_man = OrchestratorConfig::default().dead_man_timeout();

        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(h.executor.clone().run(rx, shutdown_rx));
        for id in ["a", "b", "c"] {
            tx.send(task(id)).unwrap();
        }

        tokio::time::sleep(Duration::from_secs(31)).await;
        let stale = h.store.list_stale_joining(Utc::now() - dead_man).await.unwrap();
        assert!(stale.is_empty(), "live claims swept: {:?}", stale);
        assert_eq!(h.store.get("a").await.unwrap().unwrap().join_attempts, 1);
        assert_eq!(h.store.get("b").await.unwrap().unwrap().join_attempts, 0);

        drop(tx);
        runner.await.unwrap();

        for id in ["a", "b", "c"] {
            let stored = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(stored.join_status, JoinStatus::Failed);
            assert_eq!(stored.failure_reason, Some(FailureReason::JoinExhausted));
            assert_eq!(stored.join_attempts, 3);
        }
        assert_eq!(h.joiner.calls(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_attempts() {
        let h = harness(&[JoinStep::Hang; 3], 1);
        h.store.put(joining_event("evt-1"));

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        let runner = tokio::spawn(h.executor.clone().run(rx, shutdown_rx));
        tx.send(task("evt-1")).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();

        // Three 30s timeouts plus 5s and 10s of backoff
        assert!(started.elapsed() >= Duration::from_secs(105));
        let stored = h.store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(stored.join_status, JoinStatus::Failed);
        assert_eq!(stored.failure_reason, Some(FailureReason::JoinExhausted));
        assert_eq!(stored.join_attempts, 3);
        assert_eq!(h.joiner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_queue_until_closed() {
        let h = harness(&[], 2);
        for id in ["a", "b", "c"] {
            h.store.put(joining_event(id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(h.executor.clone().run(rx, shutdown_rx));

        for id in ["a", "b", "c"] {
            tx.send(task(id)).unwrap();
        }
        drop(tx);
        runner.await.unwrap();
        drop(shutdown_tx);

        for id in ["a", "b", "c"] {
            let stored = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(stored.join_status, JoinStatus::Joined);
        }
        assert_eq!(h.recorder.starts(), 3);
    }
}
