//! Ordered schema steps for the entity tables.
//!
//! `0001_init` creates `team` and `member` with their lookup indexes;
//! `0002_auditing` adds `created_at/created_by/last_modified_at/
//! last_modified_by` to both. Repositories check every column their entity
//! metadata names, so a step that adds an entity field belongs here first.
//!
//! # Invariants
//! - Versions increase by one per step, starting at 1.
//! - A run applies all pending steps in one transaction or none of them.

use crate::db::{DbError, DbResult};
use log::{debug, info};
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        sql: include_str!("0001_init.sql"),
    },
    Migration {
        version: 2,
        name: "auditing",
        sql: include_str!("0002_auditing.sql"),
    },
];

/// Schema version a fully migrated connection reports.
pub fn latest_version() -> u32 {
    latest_of(MIGRATIONS)
}

/// Brings `conn` up to [`latest_version`].
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the database is ahead of this build.
/// - `Migration` naming the failed step; the connection stays at its
///   previous version.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    apply(conn, MIGRATIONS)
}

/// Reads `PRAGMA user_version`.
pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}

fn latest_of(steps: &[Migration]) -> u32 {
    steps.last().map_or(0, |step| step.version)
}

fn apply(conn: &mut Connection, steps: &[Migration]) -> DbResult<()> {
    let from = current_user_version(conn)?;
    let latest = latest_of(steps);
    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }

    let pending = steps.iter().filter(|step| step.version > from);
    let tx = conn.transaction()?;
    let mut applied = 0;
    for step in pending {
        let failed = |source| DbError::Migration {
            version: step.version,
            name: step.name,
            source,
        };
        tx.execute_batch(step.sql).map_err(failed)?;
        tx.pragma_update(None, "user_version", step.version)
            .map_err(failed)?;
        debug!(
            "event=db_migrate_step module=db status=ok version={} name={}",
            step.version, step.name
        );
        applied += 1;
    }
    if applied == 0 {
        return Ok(());
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from_version={from} to_version={latest} steps={applied}"
    );
    Ok(())
}
