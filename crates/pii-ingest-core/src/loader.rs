//! Bulk loading of tenant files with pseudonymize-before-persist
//!
//! Rows are written into a staging table which replaces the tenant table in
//! the same transaction, so readers see either the previous table or the full
//! new one.

use crate::checkpoint::clear_checkpoints;
use crate::error::{PipelineError, Result};
use crate::hasher::{hash_value, Salt};
use crate::record::Record;
use crate::schema::validate_schema;
use crate::store::{quote_ident, staging_table, tenant_table_ddl, validate_identifier, Store};
use rusqlite::{params, TransactionBehavior};
use std::path::Path;
use tracing::{debug, info};

/// Hash the PII column of a record in place.
pub fn pseudonymize(record: &mut Record, pii_column: &str, salt: &Salt) -> Result<()> {
    let field = record.text_field_mut(pii_column).ok_or_else(|| {
        PipelineError::configuration(format!(
            "PII column '{}' is not a text column of the input contract",
            pii_column
        ))
    })?;
    *field = hash_value(field.as_deref(), salt);
    Ok(())
}

/// Load `file` into `table`, replacing any previous content. Returns the
/// number of rows written.
pub fn load_and_pseudonymize(
    store: &mut Store,
    file: &Path,
    table: &str,
    salt: &Salt,
    pii_column: &str,
) -> Result<usize> {
    validate_identifier(table)?;
    validate_schema(file)?;

    let mut reader = csv::Reader::from_path(file).map_err(|e| PipelineError::csv(file, e))?;
    let staging = staging_table(table);

    let tx = store
        .connection_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&staging)), [])?;
    tx.execute(&tenant_table_ddl(&staging), [])?;

    let mut rows = 0usize;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} (id, user_id, event_time, value, country) VALUES (?1, ?2, ?3, ?4, ?5)",
            quote_ident(&staging)
        ))?;

        for result in reader.deserialize::<Record>() {
            let mut record = result.map_err(|e| PipelineError::csv(file, e))?;
            pseudonymize(&mut record, pii_column, salt)?;
            stmt.execute(params![
                record.id,
                record.user_id,
                record.event_time,
                record.value,
                record.country
            ])?;
            rows += 1;
        }
    }
    debug!("Staged {} rows from {} into {}", rows, file.display(), staging);

    tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
    tx.execute(
        &format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&staging),
            quote_ident(table)
        ),
        [],
    )?;
    clear_checkpoints(&tx, table)?;
    tx.commit()?;

    info!(
        "Data from {} loaded and pseudonymized into {} ({} rows)",
        file.display(),
        table,
        rows
    );
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::expected_columns;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "id,user_id,event_time,value,country\n";

    fn csv_file(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    fn salt() -> Salt {
        Salt::new("shuru").unwrap()
    }

    fn user_ids(store: &Store, table: &str) -> Vec<Option<String>> {
        let mut stmt = store
            .connection()
            .prepare(&format!("SELECT user_id FROM {} ORDER BY id", table))
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_load_hashes_pii_column() {
        let file = csv_file(
            "1,alice,2025-06-16T08:00:00,10.5,DE\n2,bob,2025-06-16T09:00:00,3.0,FR\n3,,2025-06-16T10:00:00,,US\n",
        );
        let mut store = Store::open_in_memory().unwrap();

        let rows = load_and_pseudonymize(&mut store, file.path(), "tenant1", &salt(), "user_id").unwrap();
        assert_eq!(rows, 3);

        let stored = user_ids(&store, "tenant1");
        assert_eq!(stored[0], hash_value(Some("alice"), &salt()));
        assert_eq!(stored[1], hash_value(Some("bob"), &salt()));
        assert_eq!(stored[2], None);
        assert!(!stored.contains(&Some("alice".to_string())));
    }

    #[test]
    fn test_loaded_table_matches_contract() {
        let file = csv_file("1,alice,2025-06-16T08:00:00,10.5,DE\n");
        let mut store = Store::open_in_memory().unwrap();
        load_and_pseudonymize(&mut store, file.path(), "tenant1", &salt(), "user_id").unwrap();

        assert_eq!(store.describe("tenant1").unwrap(), expected_columns());
        assert_eq!(store.list_tables().unwrap(), vec!["tenant1"]);
    }

    #[test]
    fn test_reload_replaces_content() {
        let file = csv_file("1,alice,2025-06-16T08:00:00,10.5,DE\n2,bob,2025-06-16T09:00:00,3.0,FR\n");
        let mut store = Store::open_in_memory().unwrap();

        load_and_pseudonymize(&mut store, file.path(), "tenant1", &salt(), "user_id").unwrap();
        let first = user_ids(&store, "tenant1");

        load_and_pseudonymize(&mut store, file.path(), "tenant1", &salt(), "user_id").unwrap();
        assert_eq!(store.row_count("tenant1").unwrap(), 2);
        assert_eq!(user_ids(&store, "tenant1"), first);
    }

    #[test]
    fn test_failed_load_keeps_previous_table() {
        let good = csv_file("1,alice,2025-06-16T08:00:00,10.5,DE\n");
        let bad = csv_file("2,bob,2025-06-16T09:00:00,3.0,FR\nnot-a-number,carol,x,1.0,IT\n");
        let mut store = Store::open_in_memory().unwrap();

        load_and_pseudonymize(&mut store, good.path(), "tenant1", &salt(), "user_id").unwrap();
        let err = load_and_pseudonymize(&mut store, bad.path(), "tenant1", &salt(), "user_id")
            .unwrap_err();

        assert!(matches!(err, PipelineError::Csv { .. }));
        assert_eq!(store.row_count("tenant1").unwrap(), 1);
        assert_eq!(store.list_tables().unwrap(), vec!["tenant1"]);
    }

    #[test]
    fn test_schema_mismatch_rejected_before_storage() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"id,event_time,user_id,value,country\n1,x,alice,1.0,DE\n")
            .unwrap();
        let mut store = Store::open_in_memory().unwrap();

        let err = load_and_pseudonymize(&mut store, file.path(), "tenant1", &salt(), "user_id")
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
        assert!(store.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_padded_header_rejected_before_storage() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"id, user_id, event_time, value, country\n1, alice, x, 1.0, DE\n")
            .unwrap();
        let mut store = Store::open_in_memory().unwrap();

        let err = load_and_pseudonymize(&mut store, file.path(), "tenant1", &salt(), "user_id")
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
        assert!(store.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_load_leaves_similarly_named_tenant_alone() {
        let file = csv_file("1,alice,2025-06-16T08:00:00,10.5,DE\n");
        let mut store = Store::open_in_memory().unwrap();
        store.create_table("acme__staging").unwrap();
        store
            .connection()
            .execute("INSERT INTO acme__staging (id, user_id) VALUES (7, 'kept')", [])
            .unwrap();

        load_and_pseudonymize(&mut store, file.path(), "acme", &salt(), "user_id").unwrap();

        assert_eq!(store.list_tables().unwrap(), vec!["acme", "acme__staging"]);
        assert_eq!(store.row_count("acme__staging").unwrap(), 1);
        assert_eq!(store.row_count("acme").unwrap(), 1);
    }

    #[test]
    fn test_alternate_pii_column() {
        let file = csv_file("1,alice,2025-06-16T08:00:00,10.5,DE\n");
        let mut store = Store::open_in_memory().unwrap();
        load_and_pseudonymize(&mut store, file.path(), "tenant1", &salt(), "country").unwrap();

        let country: String = store
            .connection()
            .query_row("SELECT country FROM tenant1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(Some(country), hash_value(Some("DE"), &salt()));
        assert_eq!(user_ids(&store, "tenant1"), vec![Some("alice".to_string())]);
    }

    #[test]
    fn test_non_text_pii_column_rejected() {
        let file = csv_file("1,alice,2025-06-16T08:00:00,10.5,DE\n");
        let mut store = Store::open_in_memory().unwrap();
        let err = load_and_pseudonymize(&mut store, file.path(), "tenant1", &salt(), "value")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
