//! Trigger scheduler for auto-join
//!
//! One periodic loop that, each tick:
//! - Fails pending events whose grace window closed unclaimed (`missed-window`)
//! - Fails `joining` events older than the dead-man's-switch timeout (`abandoned`)
//! - Claims events whose join window is open and queues a join task for each
//! - Completes joined events past `end_time + buffer`
//!
//! Ticks never overlap: a tick still running when the next one is due is
//! skipped and logged. Sleep/wake is detected by comparing wall-clock gaps
//! between ticks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::collaborators::Entitlements;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::recording::RecordingTrigger;
use crate::store::EventStore;
use crate::types::{FailureReason, JoinStatus, JoinTask, JoinTrigger, TransitionMetadata};

/// A wall-clock gap this many poll intervals long is treated as a wake.
const WAKE_JUMP_INTERVALS: u32 = 5;

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub missed: usize,
    pub abandoned: usize,
    pub claimed: usize,
    /// Claims lost to another worker.
    pub conflicts: usize,
    /// Skipped by the entitlement check.
    pub denied: usize,
    pub completed: usize,
    /// True if the tick did nothing because the previous one was still running.
    pub overlapped: bool,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.missed == 0
            && self.abandoned == 0
            && self.claimed == 0
            && self.conflicts == 0
            && self.denied == 0
            && self.completed == 0
    }
}

/// Resets the in-progress flag however the tick exits.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TriggerScheduler {
    store: Arc<dyn EventStore>,
    entitlements: Arc<dyn Entitlements>,
    recording: Arc<RecordingTrigger>,
    sender: mpsc::UnboundedSender<JoinTask>,
    config: OrchestratorConfig,
    ticking: AtomicBool,
    overruns: AtomicUsize,
}

impl TriggerScheduler {
    pub fn new(
        store: Arc<dyn EventStore>,
        entitlements: Arc<dyn Entitlements>,
        recording: Arc<RecordingTrigger>,
        sender: mpsc::UnboundedSender<JoinTask>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            entitlements,
            recording,
            sender,
            config,
            ticking: AtomicBool::new(false),
            overruns: AtomicUsize::new(0),
        }
    }

    /// Ticks that outlasted the poll interval, each costing one skipped tick.
    pub fn overrun_ticks(&self) -> usize {
        self.overruns.load(Ordering::SeqCst)
    }

    /// Start the scheduler loop. Runs until `shutdown` flips or its sender
    /// is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll = self.config.poll_interval();
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let wake_threshold = chrono::Duration::from_std(poll * WAKE_JUMP_INTERVALS)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let mut last_tick: Option<DateTime<Utc>> = None;

        log::info!("Scheduler: polling every {}s", poll.as_secs());

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    log::info!("Scheduler: shutdown requested");
                    break;
                }
            }

            let now = Utc::now();
            if let Some(prev) = last_tick {
                let jump = now - prev;
                if jump > wake_threshold {
                    log::info!(
                        "Scheduler: detected system wake (time jumped {} seconds), sweeping missed joins",
                        jump.num_seconds()
                    );
                }
            }
            last_tick = Some(now);

            let started = tokio::time::Instant::now();
            let result = self.tick(now).await;
            let took = started.elapsed();
            if took > poll {
                self.overruns.fetch_add(1, Ordering::SeqCst);
                log::warn!(
                    "Scheduler: tick took {:.1}s, longer than the {}s poll interval; skipping the missed tick",
                    took.as_secs_f64(),
                    poll.as_secs()
                );
            }

            match result {
                Ok(report) if !report.is_idle() => {
                    log::info!("Scheduler: tick {:?}", report);
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Scheduler: tick aborted, retrying next interval: {}", e);
                }
            }
        }
    }

    /// One pass over the store at `now`.
    ///
    /// A store failure aborts the tick. Claims already made stay valid since
    /// each claim is a single atomic update.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, OrchestratorError> {
        if self.ticking.swap(true, Ordering::SeqCst) {
            log::warn!("Scheduler: previous tick still running, skipping");
            return Ok(TickReport {
                overlapped: true,
                ..TickReport::default()
            });
        }
        let _guard = TickGuard(&self.ticking);

        let mut report = TickReport::default();
        self.sweep_missed(now, &mut report).await?;
        self.sweep_abandoned(now, &mut report).await?;
        self.claim_eligible(now, &mut report).await?;
        report.completed = self
            .recording
            .sweep_ended(now, self.config.recording_end_buffer())
            .await?;
        Ok(report)
    }

    async fn sweep_missed(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        let grace = self.config.grace_window();
        for event in self.store.list_missed(now, grace).await? {
            let closed_at = event.window_closes_at(grace);
            let applied = self
                .store
                .update_status(
                    &event.id,
                    JoinStatus::Pending,
                    JoinStatus::Failed,
                    TransitionMetadata::failed(
                        now,
                        FailureReason::MissedWindow,
                        format!("join window closed at {}", closed_at),
                    ),
                )
                .await?;
            if applied {
                log::warn!(
                    "Scheduler: {}",
                    OrchestratorError::MissedWindow(event.id.clone())
                );
                report.missed += 1;
            }
        }
        Ok(())
    }

    async fn sweep_abandoned(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        let timeout = self.config.dead_man_timeout();
        let Some(cutoff) = now.checked_sub_signed(timeout) else {
            return Ok(());
        };
        for event in self.store.list_stale_joining(cutoff).await? {
            let applied = self
                .store
                .update_status(
                    &event.id,
                    JoinStatus::Joining,
                    JoinStatus::Failed,
                    TransitionMetadata::failed(
                        now,
                        FailureReason::Abandoned,
                        format!(
                            "no worker heartbeat for {}s",
                            timeout.num_seconds()
                        ),
                    ),
                )
                .await?;
            if applied {
                log::warn!(
                    "Scheduler: {} abandoned, last heartbeat at {} after {} attempts",
                    event.id,
                    event.status_changed_at,
                    event.join_attempts
                );
                report.abandoned += 1;
            }
        }
        Ok(())
    }

    async fn claim_eligible(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        let eligible = self
            .store
            .list_eligible(now, self.config.lead_time(), self.config.grace_window())
            .await?;

        for event in eligible {
            match self.entitlements.can_auto_join(&event.user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!(
                        "Scheduler: {} not entitled to auto-join, leaving {} pending",
                        event.user_id,
                        event.id
                    );
                    report.denied += 1;
                    continue;
                }
                Err(e) => {
                    log::warn!(
                        "Scheduler: entitlement check failed for {}: {}",
                        event.id,
                        e
                    );
                    continue;
                }
            }

            let claimed = self
                .store
                .try_claim(&event.id, JoinStatus::Pending, JoinStatus::Joining, now)
                .await?;
            if !claimed {
                log::debug!(
                    "Scheduler: {}",
                    OrchestratorError::ClaimConflict(event.id.clone())
                );
                report.conflicts += 1;
                continue;
            }

            report.claimed += 1;
            let task = JoinTask {
                event_id: event.id.clone(),
                trigger: JoinTrigger::Scheduled,
                claimed_at: now,
            };
            if self.sender.send(task).is_err() {
                // Claim stands; the dead-man's switch will fail it.
                log::error!(
                    "Scheduler: join queue closed, {} stays joining without a worker",
                    event.id
                );
            }
        }
        Ok(())
    }
}
