//! Anonymization checkpoint ledger
//!
//! One row per (table, column set). The anonymizer advances the high-water
//! mark inside each page transaction, so the ledger always agrees with the
//! data that was actually committed. The mark is only meaningful for the key
//! column it was taken on, which is recorded next to it.

use crate::error::{PipelineError, Result};
use crate::store::{quote_ident, LEDGER_TABLE};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "completed" => RunStatus::Completed,
            _ => RunStatus::Running,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub run_id: String,
    /// Hashed columns, sorted
    pub columns: Vec<String>,
    pub pk_column: String,
    pub salt_fingerprint: String,
    /// Last primary-key value committed; `None` before the first page
    pub high_water_mark: Option<Value>,
    pub rows_updated: usize,
    pub status: RunStatus,
}

pub fn ensure_ledger(conn: &Connection) -> Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (
                run_id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                columns TEXT NOT NULL,
                pk_column TEXT NOT NULL,
                salt_fingerprint TEXT NOT NULL,
                high_water_mark,
                rows_updated INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(table_name, columns)
            )",
            quote_ident(LEDGER_TABLE)
        ),
        [],
    )?;
    Ok(())
}

/// Order-insensitive key for a set of columns.
pub fn columns_key(columns: &[String]) -> Result<String> {
    let mut sorted = columns.to_vec();
    sorted.sort();
    serde_json::to_string(&sorted)
        .map_err(|e| PipelineError::configuration(format!("cannot encode column list: {}", e)))
}

const SELECT_COLUMNS: &str =
    "run_id, columns, pk_column, salt_fingerprint, high_water_mark, rows_updated, status";

pub fn find(conn: &Connection, table: &str, columns_key: &str) -> Result<Option<Checkpoint>> {
    let checkpoint = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE table_name = ?1 AND columns = ?2",
                SELECT_COLUMNS,
                quote_ident(LEDGER_TABLE)
            ),
            params![table, columns_key],
            read_checkpoint,
        )
        .optional()?;
    Ok(checkpoint)
}

/// Every checkpoint recorded for a table, oldest first.
pub fn for_table(conn: &Connection, table: &str) -> Result<Vec<Checkpoint>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE table_name = ?1 ORDER BY started_at, run_id",
        SELECT_COLUMNS,
        quote_ident(LEDGER_TABLE)
    ))?;
    let checkpoints = stmt
        .query_map(params![table], read_checkpoint)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(checkpoints)
}

fn read_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let columns: String = row.get(1)?;
    let columns = serde_json::from_str(&columns)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let high_water_mark: Value = row.get(4)?;
    Ok(Checkpoint {
        run_id: row.get(0)?,
        columns,
        pk_column: row.get(2)?,
        salt_fingerprint: row.get(3)?,
        high_water_mark: match high_water_mark {
            Value::Null => None,
            other => Some(other),
        },
        rows_updated: row.get::<_, i64>(5)? as usize,
        status: RunStatus::parse(&row.get::<_, String>(6)?),
    })
}

pub fn start(
    conn: &Connection,
    table: &str,
    columns_key: &str,
    pk_column: &str,
    salt_fingerprint: &str,
) -> Result<Checkpoint> {
    let columns = serde_json::from_str(columns_key)
        .map_err(|e| PipelineError::configuration(format!("cannot decode column list: {}", e)))?;
    let run_id = Uuid::new_v4().to_string();
    let now = now_secs();
    conn.execute(
        &format!(
            "INSERT INTO {}
             (run_id, table_name, columns, pk_column, salt_fingerprint, high_water_mark, rows_updated, status, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, ?6, ?7, ?7)",
            quote_ident(LEDGER_TABLE)
        ),
        params![
            run_id,
            table,
            columns_key,
            pk_column,
            salt_fingerprint,
            RunStatus::Running.as_str(),
            now
        ],
    )?;

    debug!("Started checkpointed run {} on table {} keyed by {}", run_id, table, pk_column);
    Ok(Checkpoint {
        run_id,
        columns,
        pk_column: pk_column.to_string(),
        salt_fingerprint: salt_fingerprint.to_string(),
        high_water_mark: None,
        rows_updated: 0,
        status: RunStatus::Running,
    })
}

pub fn advance(
    conn: &Connection,
    run_id: &str,
    high_water_mark: &Value,
    rows_updated: usize,
) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET high_water_mark = ?1, rows_updated = ?2, updated_at = ?3 WHERE run_id = ?4",
            quote_ident(LEDGER_TABLE)
        ),
        params![high_water_mark, rows_updated as i64, now_secs(), run_id],
    )?;
    Ok(())
}

pub fn complete(conn: &Connection, run_id: &str) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET status = ?1, updated_at = ?2 WHERE run_id = ?3",
            quote_ident(LEDGER_TABLE)
        ),
        params![RunStatus::Completed.as_str(), now_secs(), run_id],
    )?;
    Ok(())
}

/// Forget every checkpoint for a table, e.g. after its content was replaced.
pub fn clear_checkpoints(conn: &Connection, table: &str) -> Result<usize> {
    let ledger_exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![LEDGER_TABLE],
            |row| row.get(0),
        )
        .optional()?;
    if ledger_exists.is_none() {
        return Ok(0);
    }

    let deleted = conn.execute(
        &format!(
            "DELETE FROM {} WHERE table_name = ?1",
            quote_ident(LEDGER_TABLE)
        ),
        params![table],
    )?;
    if deleted > 0 {
        debug!("Cleared {} checkpoints for table {}", deleted, table);
    }
    Ok(deleted)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
