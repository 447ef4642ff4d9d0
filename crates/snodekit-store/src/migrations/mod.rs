//! Schema migrations, tracked through `PRAGMA user_version`.
//!
//! Migrations run on every open, in order, and each one bumps the version it
//! brings the schema to.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = fn(&Connection) -> rusqlite::Result<()>;

/// `(version after applying, name, up)`, oldest first.
const MIGRATIONS: &[(u32, &str, Migration)] = &[(1, "v001_initial", v001_initial::up)];

pub fn current_version() -> u32 {
    MIGRATIONS.last().map_or(0, |(version, _, _)| *version)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    tracing::debug!(applied, target = current_version(), "checking database migrations");

    for (version, name, up) in MIGRATIONS.iter().filter(|(v, _, _)| *v > applied) {
        tracing::info!(migration = name, "applying migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
