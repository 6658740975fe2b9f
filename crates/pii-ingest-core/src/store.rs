//! Tenant table storage using SQLite
//!
//! Wraps a single connection to the shared database. The connection is owned
//! by the `Store` and closed when it is dropped, so every operation that opens
//! a store releases it on all exit paths.

use crate::checkpoint::clear_checkpoints;
use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix of internal tables. Tenant names may not use it.
pub const RESERVED_PREFIX: &str = "_pii_ingest_";

/// Checkpoint ledger written by the anonymizer; hidden from table listings.
pub const LEDGER_TABLE: &str = "_pii_ingest_runs";

const TENANT_COLUMNS_DDL: &str =
    "id INTEGER, user_id TEXT, event_time TEXT, value REAL, country TEXT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    /// 1-based position within the primary key, 0 if not part of it
    pub primary_key_position: u32,
}

pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::open_path(
            &config.database_path,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    pub fn open_path(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
            }
            let conn = Connection::open(path)?;
            conn.busy_timeout(busy_timeout)?;
            let mode: String =
                conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            debug!("Journal mode for {}: {}", path.display(), mode);
            conn
        };

        debug!("Opened store at {:?}", path);
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_path(Path::new(":memory:"), Duration::from_secs(0))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Drop any table with this name and create an empty tenant table.
    /// Checkpoints recorded for the old content are forgotten with it.
    pub fn create_table(&mut self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])?;
        tx.execute(&tenant_table_ddl(name), [])?;
        clear_checkpoints(&tx, name)?;
        tx.commit()?;

        info!("Table {} created successfully", name);
        Ok(())
    }

    /// Create the tenant table only if it does not exist yet.
    pub fn ensure_table(&mut self, name: &str) -> Result<bool> {
        validate_identifier(name)?;
        if self.table_exists(name)? {
            debug!("Table {} already exists", name);
            return Ok(false);
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(&tenant_table_ddl(name), [])?;
        clear_checkpoints(&tx, name)?;
        tx.commit()?;
        info!("Table {} created successfully", name);
        Ok(true)
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// User tables ordered by name.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1
             ORDER BY name",
        )?;
        let names = stmt
            .query_map(params![LEDGER_TABLE], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn table_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    declared_type: row.get(2)?,
                    primary_key_position: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(PipelineError::TableNotFound {
                table: table.to_string(),
            });
        }
        Ok(columns)
    }

    /// Column names of a table in declared order.
    pub fn describe(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .table_info(table)?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        if !self.table_exists(table)? {
            return Err(PipelineError::TableNotFound {
                table: table.to_string(),
            });
        }
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// One `table : col_1, col_2, ...` line per table.
    pub fn database_summary(&self) -> Result<Vec<String>> {
        self.list_tables()?
            .into_iter()
            .map(|table| -> Result<String> {
                let columns = self.describe(&table)?;
                Ok(format!("{} : {}", table, columns.join(", ")))
            })
            .collect()
    }
}

pub(crate) fn tenant_table_ddl(name: &str) -> String {
    format!("CREATE TABLE {} ({})", quote_ident(name), TENANT_COLUMNS_DDL)
}

/// Name of the table a load of `name` is staged in before the swap.
pub(crate) fn staging_table(name: &str) -> String {
    format!("{}staging_{}", RESERVED_PREFIX, name)
}

/// Tenant and table names are interpolated into SQL and file paths, so only
/// plain identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    let re = IDENT.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

    if !re.is_match(name) {
        return Err(PipelineError::configuration(format!(
            "invalid table name '{}': expected letters, digits and underscores",
            name
        )));
    }
    if name.starts_with("sqlite_") || name.starts_with(RESERVED_PREFIX) {
        return Err(PipelineError::configuration(format!(
            "table name '{}' is reserved",
            name
        )));
    }
    Ok(())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
