//! Embedded schema migrations for the event database.
//!
//! The applied schema version lives in SQLite's `PRAGMA user_version`. Each
//! step runs in its own transaction together with the version bump, so a
//! failed step leaves the database at the previous version.

use rusqlite::Connection;

use crate::store::sqlite::DbError;

/// Ordered schema steps; step `n` (1-based) moves the database to version `n`.
const STEPS: &[(&str, &str)] = &[("baseline", include_str!("migrations/001_baseline.sql"))];

fn schema_version(conn: &Connection) -> Result<usize, DbError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(usize::try_from(version).unwrap_or(0))
}

/// Hot copy to `<db>.pre-migration.bak` so a bad upgrade can be rolled back
/// by hand. Nothing to save for a fresh or in-memory database.
fn snapshot(conn: &Connection) -> Result<(), DbError> {
    let Some(db_path) = conn.path().filter(|p| !p.is_empty()) else {
        return Ok(());
    };
    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut target = Connection::open(&backup_path)?;
    rusqlite::backup::Backup::new(conn, &mut target)?.step(-1)?;
    log::info!("SqliteEventStore: schema snapshot written to {}", backup_path);
    Ok(())
}

/// Bring the schema up to date. Returns how many steps ran.
///
/// Refuses a database written by a newer build.
pub fn run_migrations(conn: &mut Connection) -> Result<usize, DbError> {
    let current = schema_version(conn)?;
    let latest = STEPS.len();

    if current > latest {
        return Err(DbError::Migration(format!(
            "database schema v{} is newer than this build understands (v{}); \
             upgrade autojoin before opening it",
            current, latest
        )));
    }
    if current == latest {
        return Ok(0);
    }
    if current > 0 {
        snapshot(conn)?;
    }

    for (index, (name, sql)) in STEPS.iter().enumerate().skip(current) {
        let version = index + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| DbError::Migration(format!("step v{} ({}) failed: {}", version, name, e)))?;
        tx.pragma_update(None, "user_version", version as i64)?;
        tx.commit()?;
        log::info!("SqliteEventStore: schema at v{} ({})", version, name);
    }

    Ok(latest - current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let mut conn = mem_db();
        assert_eq!(run_migrations(&mut conn).expect("migrations"), 1);
        assert_eq!(schema_version(&conn).expect("version"), 1);

        conn.execute(
            "INSERT INTO calendar_events (id, user_id, start_time, end_time,
             status_changed_at, created_at, updated_at)
             VALUES ('e1', 'u1', '2026-03-02T15:00:00.000000000Z',
             '2026-03-02T16:00:00.000000000Z', '2026-03-02T14:00:00.000000000Z',
             '2026-03-02T14:00:00.000000000Z', '2026-03-02T14:00:00.000000000Z')",
            [],
        )
        .expect("calendar_events should accept a minimal row");

        let status: String = conn
            .query_row("SELECT join_status FROM calendar_events WHERE id = 'e1'", [], |row| {
                row.get(0)
            })
            .expect("row readable");
        assert_eq!(status, "pending");
    }

    #[test]
    fn test_schema_rejects_unknown_status_and_inverted_window() {
        let mut conn = mem_db();
        run_migrations(&mut conn).expect("migrations");

        let bad_status = conn.execute(
            "INSERT INTO calendar_events (id, user_id, start_time, end_time, join_status,
             status_changed_at, created_at, updated_at)
             VALUES ('e1', 'u1', '2026-03-02T15:00:00.000000000Z',
             '2026-03-02T16:00:00.000000000Z', 'running', 'x', 'x', 'x')",
            [],
        );
        assert!(bad_status.is_err());

        let inverted = conn.execute(
            "INSERT INTO calendar_events (id, user_id, start_time, end_time,
             status_changed_at, created_at, updated_at)
             VALUES ('e2', 'u1', '2026-03-02T16:00:00.000000000Z',
             '2026-03-02T15:00:00.000000000Z', 'x', 'x', 'x')",
            [],
        );
        assert!(inverted.is_err());
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let mut conn = mem_db();
        conn.pragma_update(None, "user_version", 999).unwrap();

        match run_migrations(&mut conn) {
            Err(DbError::Migration(msg)) => assert!(msg.contains("newer than this build"), "{msg}"),
            other => panic!("expected a migration error, got {:?}", other),
        }
    }

    #[test]
    fn test_rerun_is_a_no_op() {
        let mut conn = mem_db();
        assert_eq!(run_migrations(&mut conn).expect("first run"), 1);
        assert_eq!(run_migrations(&mut conn).expect("second run"), 0);
        assert_eq!(schema_version(&conn).expect("version"), 1);
    }

    #[test]
    fn test_upgrade_snapshots_file_databases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        let mut conn = Connection::open(&path).unwrap();
        run_migrations(&mut conn).expect("fresh database");
        assert!(!dir.path().join("events.db.pre-migration.bak").exists());

        snapshot(&conn).expect("snapshot");
        let copy = Connection::open(dir.path().join("events.db.pre-migration.bak")).unwrap();
        assert_eq!(schema_version(&copy).unwrap(), 1);
    }
}
