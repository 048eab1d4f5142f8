//! Versioned provisioning migrations.
//!
//! # Responsibility
//! - Apply pending caller-supplied migrations atomically.
//!
//! # Invariants
//! - `version` values must be strictly increasing.
//! - Applied migration version is mirrored to `PRAGMA user_version`.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::{Connection, TransactionBehavior};
use std::borrow::Cow;
use std::time::Instant;

/// One provisioning step: table/column/index/foreign-key creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub sql: Cow<'static, str>,
}

impl Migration {
    pub fn new(version: u32, sql: impl Into<Cow<'static, str>>) -> Self {
        Self {
            version,
            sql: sql.into(),
        }
    }
}

/// Returns the latest version in `migrations`, `0` when empty.
pub fn latest_version(migrations: &[Migration]) -> u32 {
    migrations.last().map_or(0, |migration| migration.version)
}

/// Applies all pending migrations on the provided connection.
pub fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> DbResult<()> {
    check_order(migrations)?;
    let current_version = current_user_version(conn)?;
    let latest = latest_version(migrations);

    if current_version > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: current_version,
            latest_supported: latest,
        });
    }

    if current_version == latest {
        return Ok(());
    }

    let started_at = Instant::now();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut applied = 0usize;
    for migration in migrations {
        if migration.version <= current_version {
            continue;
        }

        tx.execute_batch(&migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
        applied += 1;
    }
    tx.commit()?;

    info!(
        "event=migrations_apply module=db status=ok from_version={} to_version={} applied={} duration_ms={}",
        current_version,
        latest,
        applied,
        started_at.elapsed().as_millis()
    );
    Ok(())
}

/// Reads the applied migration version.
pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}

fn check_order(migrations: &[Migration]) -> DbResult<()> {
    for pair in migrations.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(DbError::MigrationOrder {
                previous: pair[0].version,
                next: pair[1].version,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{apply_migrations, current_user_version, Migration};
    use crate::db::DbError;
    use rusqlite::Connection;

    #[test]
    fn applies_pending_steps_only() {
        let mut conn = Connection::open_in_memory().unwrap();
        let first = vec![Migration::new(1, "CREATE TABLE movies (id INTEGER PRIMARY KEY);")];
        apply_migrations(&mut conn, &first).unwrap();

        let mut both = first.clone();
        both.push(Migration::new(
            2,
            "CREATE TABLE actors (id INTEGER PRIMARY KEY);",
        ));
        apply_migrations(&mut conn, &both).unwrap();
        apply_migrations(&mut conn, &both).unwrap();

        assert_eq!(current_user_version(&conn).unwrap(), 2);
    }

    #[test]
    fn failed_step_rolls_back_whole_batch() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = vec![
            Migration::new(1, "CREATE TABLE movies (id INTEGER PRIMARY KEY);"),
            Migration::new(2, "CREATE TABLE broken ("),
        ];

        assert!(apply_migrations(&mut conn, &migrations).is_err());
        assert_eq!(current_user_version(&conn).unwrap(), 0);
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'movies';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn pending_steps_need_the_write_lock_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkage.db");
        let writer = Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let mut conn = Connection::open(&path).unwrap();
        conn.busy_timeout(std::time::Duration::ZERO).unwrap();
        let migrations = vec![Migration::new(1, "CREATE TABLE movies (id INTEGER PRIMARY KEY);")];
        let err = apply_migrations(&mut conn, &migrations).unwrap_err();
        assert!(matches!(err, DbError::Sqlite(_)));

        writer.execute_batch("ROLLBACK;").unwrap();
        apply_migrations(&mut conn, &migrations).unwrap();
        assert_eq!(current_user_version(&conn).unwrap(), 1);
    }

    #[test]
    fn rejects_non_increasing_versions() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = vec![Migration::new(2, "SELECT 1;"), Migration::new(2, "SELECT 1;")];

        let err = apply_migrations(&mut conn, &migrations).unwrap_err();
        assert!(matches!(
            err,
            DbError::MigrationOrder {
                previous: 2,
                next: 2
            }
        ));
    }
}
