//! Schema creation and version migration.
//!
//! The stored version only ever increases. Migration runs under the
//! exclusive store lock and re-reads the version first, so a process that
//! lost the migration race becomes a no-op.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Transaction};

use crate::error::StoreError;

/// Schema version this crate writes and expects.
pub(crate) const DB_VERSION: u32 = 2;

const CREATE_STMTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS version (version INTEGER)",
    "CREATE TABLE IF NOT EXISTS aciinfo (\
        blobkey TEXT PRIMARY KEY, \
        appname TEXT NOT NULL, \
        importtime INTEGER NOT NULL, \
        latest INTEGER NOT NULL DEFAULT 0)",
    "CREATE INDEX IF NOT EXISTS aciinfo_appname ON aciinfo (appname)",
    "CREATE TABLE IF NOT EXISTS remote (\
        aciurl TEXT PRIMARY KEY, \
        sigurl TEXT, \
        etag TEXT, \
        blobkey TEXT NOT NULL)",
];

/// Whether the database has been initialized at all.
pub(crate) fn is_populated(tx: &Transaction<'_>) -> Result<bool> {
    let found = tx
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'version'",
            [],
            |_| Ok(()),
        )
        .optional()
        .context("failed to inspect the index schema")?;
    Ok(found.is_some())
}

/// Create the full current schema and stamp it with [`DB_VERSION`].
pub(crate) fn init(tx: &Transaction<'_>) -> Result<()> {
    for stmt in CREATE_STMTS {
        tx.execute(stmt, [])
            .with_context(|| format!("failed to run schema statement: {stmt}"))?;
    }
    set_version(tx, DB_VERSION)
}

/// Read the stored schema version.
pub(crate) fn version(tx: &Transaction<'_>) -> Result<u32> {
    let version = tx
        .query_row("SELECT version FROM version LIMIT 1", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .context("failed to read the schema version")?;
    match version {
        Some(v) => Ok(v as u32),
        None => Err(StoreError::Index("the version table is empty".to_string()).into()),
    }
}

fn set_version(tx: &Transaction<'_>, version: u32) -> Result<()> {
    tx.execute("DELETE FROM version", [])
        .context("failed to clear the schema version")?;
    tx.execute(
        "INSERT INTO version (version) VALUES (?1)",
        params![version as i64],
    )
    .context("failed to record the schema version")?;
    Ok(())
}

/// Walk the stored version up to `to`, one step at a time, inside the
/// caller's transaction. Reading the version here (rather than trusting the
/// caller's earlier check) is what makes a lost migration race harmless.
pub(crate) fn migrate(tx: &Transaction<'_>, to: u32) -> Result<()> {
    let from = version(tx)?;
    if from > to {
        return Err(StoreError::FutureSchema {
            stored: from,
            expected: to,
        }
        .into());
    }
    for step in from..to {
        match step {
            1 => migrate_v1_to_v2(tx)?,
            other => {
                return Err(StoreError::Index(format!(
                    "no migration path from schema version {other}"
                ))
                .into())
            }
        }
    }
    set_version(tx, to)
}

// Version 1 predates the latest flag on imports.
fn migrate_v1_to_v2(tx: &Transaction<'_>) -> Result<()> {
    tx.execute(
        "ALTER TABLE aciinfo ADD COLUMN latest INTEGER NOT NULL DEFAULT 0",
        [],
    )
    .context("failed to add the latest column to aciinfo")?;
    Ok(())
}

/// Overwrite the stored version, for migration tests.
#[cfg(test)]
pub(crate) fn force_version(tx: &Transaction<'_>, version: u32) -> Result<()> {
    set_version(tx, version)
}

/// Create the historical version-1 schema, for migration tests.
#[cfg(test)]
pub(crate) fn init_v1(tx: &Transaction<'_>) -> Result<()> {
    for stmt in [
        "CREATE TABLE version (version INTEGER)",
        "CREATE TABLE aciinfo (\
            blobkey TEXT PRIMARY KEY, \
            appname TEXT NOT NULL, \
            importtime INTEGER NOT NULL)",
        "CREATE INDEX aciinfo_appname ON aciinfo (appname)",
        "CREATE TABLE remote (\
            aciurl TEXT PRIMARY KEY, \
            sigurl TEXT, \
            etag TEXT, \
            blobkey TEXT NOT NULL)",
    ] {
        tx.execute(stmt, [])?;
    }
    set_version(tx, 1)
}
