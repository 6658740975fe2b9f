//! Batched in-place anonymization of table columns
//!
//! Rows are visited in pages ordered by the primary key and each page is
//! committed in its own transaction. Memory is bounded by the batch size and
//! a failure leaves earlier pages anonymized.
//!
//! Hashing a column twice hashes the digests, so a plain run is not
//! idempotent. With checkpointing enabled the run records a high-water mark
//! per page, resumes after a crash and refuses to hash any column a
//! checkpointed run already covered.
//!
//! Page transactions take the write lock up front so a concurrent writer
//! makes the page wait for the busy timeout instead of failing.

use crate::checkpoint::{self, RunStatus};
use crate::error::{PipelineError, Result};
use crate::hasher::{hash_sql_value, Salt};
use crate::store::{quote_ident, ColumnInfo, Store};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct AnonymizeOptions {
    /// Column used to target row updates; auto-detected when `None`
    pub pk_column: Option<String>,
    pub checkpoint: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnonymizationReport {
    pub table: String,
    pub primary_key: String,
    pub rows_updated: usize,
    /// Rows per committed page, in order
    pub pages: Vec<usize>,
    /// High-water mark of the interrupted run this one continued
    pub resumed_from: Option<Value>,
}

pub struct BatchAnonymizer {
    salt: Salt,
    batch_size: usize,
}

impl BatchAnonymizer {
    pub fn new(salt: Salt, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(PipelineError::configuration(
                "batch size must be greater than zero",
            ));
        }
        Ok(Self { salt, batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn run(
        &self,
        store: &mut Store,
        table: &str,
        columns: &[String],
        options: &AnonymizeOptions,
    ) -> Result<AnonymizationReport> {
        validate_targets(table, columns)?;

        let info = store.table_info(table)?;
        for column in columns {
            if !info.iter().any(|c| &c.name == column) {
                return Err(PipelineError::MissingColumn {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }

        let pk = resolve_primary_key(table, &info, options.pk_column.as_deref())?;
        if columns.contains(&pk) {
            return Err(PipelineError::configuration(format!(
                "primary key '{}' of table '{}' cannot be one of the hashed columns",
                pk, table
            )));
        }
        check_key_unique(store.connection(), table, &pk)?;

        let mut run = None;
        let mut high_water_mark = None;
        if options.checkpoint {
            let conn = store.connection();
            checkpoint::ensure_ledger(conn)?;
            let key = checkpoint::columns_key(columns)?;
            let fingerprint = self.salt.fingerprint();

            check_column_overlap(conn, table, columns)?;

            let current = match checkpoint::find(conn, table, &key)? {
                Some(existing) if existing.salt_fingerprint != fingerprint => {
                    return Err(PipelineError::SaltMismatch {
                        table: table.to_string(),
                    });
                }
                Some(existing) if existing.status == RunStatus::Completed => {
                    return Err(PipelineError::AlreadyAnonymized {
                        table: table.to_string(),
                        columns: columns.to_vec(),
                    });
                }
                Some(existing) if existing.pk_column != pk => {
                    return Err(PipelineError::configuration(format!(
                        "interrupted run on table '{}' was keyed by '{}', not '{}'; resume it with the same key",
                        table, existing.pk_column, pk
                    )));
                }
                Some(existing) => {
                    info!(
                        "Resuming anonymization of {} after {} previously committed rows",
                        table, existing.rows_updated
                    );
                    existing
                }
                None => checkpoint::start(conn, table, &key, &pk, &fingerprint)?,
            };
            high_water_mark = current.high_water_mark.clone();
            run = Some(current);
        }
        let resumed_from = high_water_mark.clone();

        let update = update_statement(table, &pk, columns);
        let mut ledger_rows = run.as_ref().map(|r| r.rows_updated).unwrap_or(0);
        let mut total_updated = 0usize;
        let mut pages = Vec::new();

        loop {
            let select = page_query(table, &pk, columns, high_water_mark.is_some());
            let tx = store
                .connection_mut()
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows = fetch_page(&tx, &select, high_water_mark.as_ref(), self.batch_size)?;
            if rows.is_empty() {
                break;
            }

            {
                let mut stmt = tx.prepare_cached(&update)?;
                for (pk_value, values) in &rows {
                    let mut bound = Vec::with_capacity(values.len() + 1);
                    for (column, value) in columns.iter().zip(values) {
                        bound.push(hash_sql_value(value, &self.salt, table, column)?);
                    }
                    bound.push(pk_value.clone());
                    stmt.execute(params_from_iter(bound.iter()))?;
                }
            }

            let page_rows = rows.len();
            let last_key = rows.last().map(|(pk_value, _)| pk_value.clone());
            if let (Some(current), Some(last)) = (run.as_ref(), last_key.as_ref()) {
                ledger_rows += page_rows;
                checkpoint::advance(&tx, &current.run_id, last, ledger_rows)?;
            }
            tx.commit()?;

            total_updated += page_rows;
            pages.push(page_rows);
            high_water_mark = last_key;
            debug!("Processed {} rows of {}...", total_updated, table);
        }

        if let Some(current) = run {
            checkpoint::complete(store.connection(), &current.run_id)?;
        }

        info!(
            "Anonymization of {} complete. Total rows updated: {} in {} pages",
            table,
            total_updated,
            pages.len()
        );
        Ok(AnonymizationReport {
            table: table.to_string(),
            primary_key: pk,
            rows_updated: total_updated,
            pages,
            resumed_from,
        })
    }
}

/// Rewrite `columns` of `table` with salted hashes, `batch_size` rows per
/// committed page.
pub fn anonymize(
    store: &mut Store,
    table: &str,
    columns: &[String],
    salt: &Salt,
    batch_size: usize,
    options: &AnonymizeOptions,
) -> Result<AnonymizationReport> {
    BatchAnonymizer::new(salt.clone(), batch_size)?.run(store, table, columns, options)
}

fn validate_targets(table: &str, columns: &[String]) -> Result<()> {
    if columns.is_empty() {
        return Err(PipelineError::configuration(format!(
            "no columns to hash were given for table '{}'",
            table
        )));
    }
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].contains(column) {
            return Err(PipelineError::configuration(format!(
                "column '{}' of table '{}' was requested more than once",
                column, table
            )));
        }
    }
    Ok(())
}

/// Explicit key, else the first declared primary-key column, else the first
/// column of the table.
pub fn resolve_primary_key(table: &str, info: &[ColumnInfo], explicit: Option<&str>) -> Result<String> {
    if let Some(pk) = explicit {
        if !info.iter().any(|c| c.name == pk) {
            return Err(PipelineError::MissingColumn {
                table: table.to_string(),
                column: pk.to_string(),
            });
        }
        return Ok(pk.to_string());
    }

    if let Some(declared) = info.iter().find(|c| c.primary_key_position == 1) {
        return Ok(declared.name.clone());
    }

    let first = info.first().ok_or_else(|| PipelineError::TableNotFound {
        table: table.to_string(),
    })?;
    warn!(
        "Table {} declares no primary key; falling back to first column '{}'",
        table, first.name
    );
    Ok(first.name.clone())
}

/// A column belongs to at most one checkpointed column set per table.
fn check_column_overlap(conn: &Connection, table: &str, columns: &[String]) -> Result<()> {
    let mut requested = columns.to_vec();
    requested.sort();

    for existing in checkpoint::for_table(conn, table)? {
        if existing.columns == requested {
            continue;
        }
        let shared: Vec<String> = columns
            .iter()
            .filter(|c| existing.columns.contains(*c))
            .cloned()
            .collect();
        if shared.is_empty() {
            continue;
        }
        if existing.status == RunStatus::Completed {
            return Err(PipelineError::AlreadyAnonymized {
                table: table.to_string(),
                columns: shared,
            });
        }
        return Err(PipelineError::configuration(format!(
            "columns {:?} of table '{}' belong to an interrupted run over {:?}; resume that run first",
            shared, table, existing.columns
        )));
    }
    Ok(())
}

fn check_key_unique(conn: &Connection, table: &str, pk: &str) -> Result<()> {
    let (total, non_null, distinct): (i64, i64, i64) = conn.query_row(
        &format!(
            "SELECT COUNT(*), COUNT({pk}), COUNT(DISTINCT {pk}) FROM {table}",
            pk = quote_ident(pk),
            table = quote_ident(table)
        ),
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    if non_null != total {
        return Err(PipelineError::configuration(format!(
            "primary key '{}' of table '{}' contains {} NULL values",
            pk,
            table,
            total - non_null
        )));
    }
    if distinct != non_null {
        return Err(PipelineError::configuration(format!(
            "primary key '{}' of table '{}' is not unique ({} duplicate values)",
            pk,
            table,
            non_null - distinct
        )));
    }
    Ok(())
}

fn page_query(table: &str, pk: &str, columns: &[String], after_key: bool) -> String {
    let selected: Vec<String> = std::iter::once(pk)
        .chain(columns.iter().map(String::as_str))
        .map(quote_ident)
        .collect();
    let filter = if after_key {
        format!(" WHERE {} > ?1", quote_ident(pk))
    } else {
        String::new()
    };
    let limit = if after_key { "?2" } else { "?1" };

    format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {}",
        selected.join(", "),
        quote_ident(table),
        filter,
        quote_ident(pk),
        limit
    )
}

fn update_statement(table: &str, pk: &str, columns: &[String]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
        .collect();

    format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        quote_ident(table),
        assignments.join(", "),
        quote_ident(pk),
        columns.len() + 1
    )
}

fn fetch_page(
    conn: &Connection,
    select: &str,
    after: Option<&Value>,
    batch_size: usize,
) -> Result<Vec<(Value, Vec<Value>)>> {
    let mut stmt = conn.prepare_cached(select)?;
    let width = stmt.column_count();
    let limit = batch_size as i64;

    let rows = match after {
        Some(key) => stmt
            .query_map(rusqlite::params![key, limit], |row| read_page_row(row, width))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt
            .query_map(rusqlite::params![limit], |row| read_page_row(row, width))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(rows)
}

// Column 0 is the primary key, the rest are the hash targets in order.
fn read_page_row(row: &rusqlite::Row<'_>, width: usize) -> rusqlite::Result<(Value, Vec<Value>)> {
    let pk: Value = row.get(0)?;
    let values = (1..width)
        .map(|i| row.get::<_, Value>(i))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((pk, values))
}
