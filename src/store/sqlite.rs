//! SQLite-backed event store.
//!
//! The database lives at `~/.autojoin/autojoin.db` unless configured
//! otherwise. Each claim or transition is a single
//! `UPDATE ... WHERE id = ? AND join_status = ?` inside a short transaction
//! that also appends to `join_transitions`; no read-modify-write.
//!
//! The connection sits behind a `parking_lot` mutex and every call runs on
//! the blocking pool so the scheduler loop never stalls on disk I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use super::{transition_record, validate_schedule, EventStore};
use crate::error::OrchestratorError;
use crate::state_machine::validate_transition;
use crate::types::{
    to_db_time, CalendarEvent, EventSource, FailureReason, JoinStatus, SyncedEvent,
    TransitionMetadata, TransitionRecord,
};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Database worker failed: {0}")]
    Worker(String),
}

const EVENT_COLUMNS: &str = "id, user_id, title, start_time, end_time, meeting_link,
    auto_join_enabled, auto_record_enabled, join_status, status_changed_at, join_attempts,
    failure_reason, last_error, recording_id, recording_error, project_id, source,
    created_at, updated_at";

pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let mut conn = Connection::open(&path)?;

        // WAL lets readers proceed while a claim is being written
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&mut conn)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        log::info!("SqliteEventStore: opened {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &Path) -> Result<Self, DbError> {
        Self::open_at(path.to_path_buf())
    }

    async fn run<F, T>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| DbError::Worker(e.to_string()))?;
        Ok(result?)
    }

    /// `args` bind in order; a `None` bound is an open end of the window.
    async fn select(
        &self,
        predicate: &'static str,
        args: Vec<Option<String>>,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM calendar_events WHERE {} ORDER BY start_time, id",
                EVENT_COLUMNS, predicate
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_event)?;
            let events = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
        .await
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn is_duplicate_key(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<CalendarEvent> {
    let status: String = row.get(8)?;
    let failure_reason: Option<String> = row.get(11)?;
    let source: String = row.get(16)?;
    let attempts: i64 = row.get(10)?;

    Ok(CalendarEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        start_time: time_at(row, 3)?,
        end_time: time_at(row, 4)?,
        meeting_link: row.get(5)?,
        auto_join_enabled: row.get(6)?,
        auto_record_enabled: row.get(7)?,
        join_status: status.parse::<JoinStatus>().map_err(|e: String| conversion_error(8, e))?,
        status_changed_at: time_at(row, 9)?,
        join_attempts: u32::try_from(attempts).unwrap_or(0),
        failure_reason: failure_reason
            .map(|r| r.parse::<FailureReason>().map_err(|e: String| conversion_error(11, e)))
            .transpose()?,
        last_error: row.get(12)?,
        recording_id: row.get(13)?,
        recording_error: row.get(14)?,
        project_id: row.get(15)?,
        source: source.parse::<EventSource>().map_err(|e: String| conversion_error(16, e))?,
        created_at: time_at(row, 17)?,
        updated_at: time_at(row, 18)?,
    })
}

fn apply_transition_sql(
    conn: &mut Connection,
    event_id: &str,
    from: JoinStatus,
    to: JoinStatus,
    metadata: &TransitionMetadata,
) -> Result<bool, DbError> {
    let tx = conn.transaction()?;
    let at = to_db_time(&metadata.at);
    let fresh_claim = to == JoinStatus::Joining;
    let requires_auto_join = from == JoinStatus::Pending && to == JoinStatus::Joining;
    let recording_id = if to == JoinStatus::Joined {
        metadata.recording_id.clone()
    } else {
        None
    };

    let changed = tx.execute(
        "UPDATE calendar_events
         SET join_status = ?1,
             status_changed_at = ?2,
             updated_at = ?2,
             join_attempts = COALESCE(?3, CASE WHEN ?4 THEN 0 ELSE join_attempts END),
             failure_reason = COALESCE(?5, CASE WHEN ?4 THEN NULL ELSE failure_reason END),
             last_error = COALESCE(?6, CASE WHEN ?4 THEN NULL ELSE last_error END),
             recording_id = COALESCE(?7, recording_id)
         WHERE id = ?8
           AND join_status = ?9
           AND (?10 = 0 OR auto_join_enabled = 1)",
        params![
            to.as_str(),
            at,
            metadata.join_attempts,
            fresh_claim,
            metadata.failure_reason.map(|r| r.as_str()),
            metadata.last_error,
            recording_id,
            event_id,
            from.as_str(),
            requires_auto_join,
        ],
    )?;

    if changed == 0 {
        return Ok(false);
    }

    let record = transition_record(event_id, from, to, metadata);
    tx.execute(
        "INSERT INTO join_transitions (event_id, from_status, to_status, at, reason)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.event_id,
            record.from.as_str(),
            record.to.as_str(),
            to_db_time(&record.at),
            record.reason,
        ],
    )?;
    tx.commit()?;
    Ok(true)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn get(&self, event_id: &str) -> Result<Option<CalendarEvent>, OrchestratorError> {
        let event_id = event_id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {} FROM calendar_events WHERE id = ?1", EVENT_COLUMNS);
            let event = conn
                .query_row(&sql, params![event_id], row_to_event)
                .optional()?;
            Ok(event)
        })
        .await
    }

    async fn update_status(
        &self,
        event_id: &str,
        from: JoinStatus,
        to: JoinStatus,
        metadata: TransitionMetadata,
    ) -> Result<bool, OrchestratorError> {
        validate_transition(event_id, from, to)?;
        let event_id = event_id.to_string();
        self.run(move |conn| apply_transition_sql(conn, &event_id, from, to, &metadata))
            .await
    }

    async fn heartbeat(
        &self,
        event_id: &str,
        attempts: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let event_id = event_id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE calendar_events
                 SET status_changed_at = ?1,
                     updated_at = ?1,
                     join_attempts = COALESCE(?2, join_attempts)
                 WHERE id = ?3 AND join_status = 'joining'",
                params![to_db_time(&now), attempts, event_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        lead: chrono::Duration,
        grace: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        // start - lead <= now <= start + grace  <=>  now - grace <= start <= now + lead
        let earliest = now.checked_sub_signed(grace).map(|t| to_db_time(&t));
        let latest = now.checked_add_signed(lead).map(|t| to_db_time(&t));
        self.select(
            "join_status = 'pending' AND auto_join_enabled = 1
             AND (?1 IS NULL OR start_time >= ?1) AND (?2 IS NULL OR start_time <= ?2)",
            vec![earliest, latest],
        )
        .await
    }

    async fn list_missed(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        // A grace window reaching past the clock's range never closes
        let Some(closed_before) = now.checked_sub_signed(grace) else {
            return Ok(Vec::new());
        };
        self.select(
            "join_status = 'pending' AND auto_join_enabled = 1 AND start_time < ?1",
            vec![Some(to_db_time(&closed_before))],
        )
        .await
    }

    async fn list_stale_joining(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        self.select(
            "join_status = 'joining' AND status_changed_at < ?1",
            vec![Some(to_db_time(&cutoff))],
        )
        .await
    }

    async fn list_due_for_completion(
        &self,
        now: DateTime<Utc>,
        buffer: chrono::Duration,
    ) -> Result<Vec<CalendarEvent>, OrchestratorError> {
        let Some(ended_by) = now.checked_sub_signed(buffer) else {
            return Ok(Vec::new());
        };
        self.select(
            "join_status = 'joined' AND end_time <= ?1",
            vec![Some(to_db_time(&ended_by))],
        )
        .await
    }

    async fn upsert_synced(
        &self,
        synced: &SyncedEvent,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        validate_schedule(&synced.id, synced.start_time, synced.end_time)?;
        let synced = synced.clone();
        self.run(move |conn| {
            let now = to_db_time(&now);
            conn.execute(
                "INSERT INTO calendar_events (id, user_id, title, start_time, end_time,
                    meeting_link, auto_join_enabled, auto_record_enabled, join_status,
                    status_changed_at, project_id, source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10, 'calendar', ?9, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    meeting_link = excluded.meeting_link,
                    auto_join_enabled = excluded.auto_join_enabled,
                    auto_record_enabled = excluded.auto_record_enabled,
                    project_id = excluded.project_id,
                    updated_at = excluded.updated_at",
                params![
                    synced.id,
                    synced.user_id,
                    synced.title,
                    to_db_time(&synced.start_time),
                    to_db_time(&synced.end_time),
                    synced.meeting_link,
                    synced.auto_join_enabled,
                    synced.auto_record_enabled,
                    now,
                    synced.project_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, event: &CalendarEvent) -> Result<(), OrchestratorError> {
        validate_schedule(&event.id, event.start_time, event.end_time)?;
        let event = event.clone();
        let event_id = event.id.clone();
        let inserted = self
            .run(move |conn| {
                let result = conn.execute(
                    "INSERT INTO calendar_events (id, user_id, title, start_time, end_time,
                        meeting_link, auto_join_enabled, auto_record_enabled, join_status,
                        status_changed_at, join_attempts, failure_reason, last_error,
                        recording_id, recording_error, project_id, source, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                        ?16, ?17, ?18, ?19)",
                    params![
                        event.id,
                        event.user_id,
                        event.title,
                        to_db_time(&event.start_time),
                        to_db_time(&event.end_time),
                        event.meeting_link,
                        event.auto_join_enabled,
                        event.auto_record_enabled,
                        event.join_status.as_str(),
                        to_db_time(&event.status_changed_at),
                        event.join_attempts,
                        event.failure_reason.map(|r| r.as_str()),
                        event.last_error,
                        event.recording_id,
                        event.recording_error,
                        event.project_id,
                        event.source.as_str(),
                        to_db_time(&event.created_at),
                        to_db_time(&event.updated_at),
                    ],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(e) if is_duplicate_key(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if inserted {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidEvent(format!(
                "event {} already exists",
                event_id
            )))
        }
    }

    async fn set_auto_join(
        &self,
        event_id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let event_id = event_id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE calendar_events SET auto_join_enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled, to_db_time(&now), event_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn attach_recording(
        &self,
        event_id: &str,
        recording_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let event_id = event_id.to_string();
        let recording_id = recording_id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE calendar_events
                 SET recording_id = ?1, recording_error = NULL, updated_at = ?2
                 WHERE id = ?3 AND join_status IN ('joined', 'completed')",
                params![recording_id, to_db_time(&now), event_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn note_recording_failure(
        &self,
        event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let event_id = event_id.to_string();
        let error = error.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE calendar_events
                 SET recording_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND join_status IN ('joined', 'completed')",
                params![error, to_db_time(&now), event_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn history(&self, event_id: &str) -> Result<Vec<TransitionRecord>, OrchestratorError> {
        let event_id = event_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, from_status, to_status, at, reason
                 FROM join_transitions WHERE event_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![event_id], |row| {
                let from: String = row.get(1)?;
                let to: String = row.get(2)?;
                Ok(TransitionRecord {
                    event_id: row.get(0)?,
                    from: from.parse::<JoinStatus>().map_err(|e: String| conversion_error(1, e))?,
                    to: to.parse::<JoinStatus>().map_err(|e: String| conversion_error(2, e))?,
                    at: time_at(row, 3)?,
                    reason: row.get(4)?,
                })
            })?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}
