use pii_ingest_core::{
    anonymize, expected_columns, hash_value, AnonymizeOptions, Config, PipelineError, Salt, Store,
    TenantPipeline,
};
use std::fmt::Write as _;
use tempfile::TempDir;

fn tenant_csv(rows: usize) -> String {
    let mut csv = String::from("id,user_id,event_time,value,country\n");
    for id in 1..=rows {
        writeln!(
            csv,
            "{},user_{},2025-06-16T{:02}:00:00,{}.25,{}",
            id,
            id,
            id % 24,
            id,
            if id % 2 == 0 { "DE" } else { "FR" }
        )
        .unwrap();
    }
    csv
}

fn pipeline_in(temp_dir: &TempDir) -> (TenantPipeline, Config) {
    let mut config = Config::default();
    config.storage.database_path = temp_dir.path().join("sqlite.db");
    config.ingest.input_dir = temp_dir.path().join("raw_data");
    config.pseudonymization.salt = Some("shuru".to_string());
    std::fs::create_dir_all(&config.ingest.input_dir).unwrap();

    let pipeline = TenantPipeline::new(&config, config.salt().unwrap());
    (pipeline, config)
}

#[test]
fn test_load_then_describe_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let (pipeline, config) = pipeline_in(&temp_dir);
    std::fs::write(pipeline.tenant_file("tenant1"), tenant_csv(20)).unwrap();

    let report = pipeline.run_tenant("tenant1").unwrap();
    assert_eq!(report.rows_loaded, 20);

    let store = Store::open(&config.storage).unwrap();
    assert_eq!(store.describe("tenant1").unwrap(), expected_columns());
    assert_eq!(store.list_tables().unwrap(), vec!["tenant1"]);
}

#[test]
fn test_repeated_load_is_replacement() {
    let temp_dir = TempDir::new().unwrap();
    let (pipeline, config) = pipeline_in(&temp_dir);
    std::fs::write(pipeline.tenant_file("tenant2"), tenant_csv(50)).unwrap();

    let snapshot = |store: &Store| -> Vec<(i64, String)> {
        let mut stmt = store
            .connection()
            .prepare("SELECT id, user_id FROM tenant2 ORDER BY id")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    };

    pipeline.run_tenant("tenant2").unwrap();
    let first = snapshot(&Store::open(&config.storage).unwrap());

    pipeline.run_tenant("tenant2").unwrap();
    let store = Store::open(&config.storage).unwrap();
    assert_eq!(store.row_count("tenant2").unwrap(), 50);
    assert_eq!(snapshot(&store), first);
}

#[test]
fn test_reanonymize_loaded_table_in_pages() {
    let temp_dir = TempDir::new().unwrap();
    let (pipeline, config) = pipeline_in(&temp_dir);
    std::fs::write(pipeline.tenant_file("tenant3"), tenant_csv(2500)).unwrap();
    pipeline.run_tenant("tenant3").unwrap();

    let salt = Salt::new("rotation-2025").unwrap();
    let mut store = Store::open(&config.storage).unwrap();
    let report = anonymize(
        &mut store,
        "tenant3",
        &["country".to_string()],
        &salt,
        1000,
        &AnonymizeOptions {
            pk_column: Some("id".to_string()),
            checkpoint: true,
        },
    )
    .unwrap();

    assert_eq!(report.rows_updated, 2500);
    assert_eq!(report.pages, vec![1000, 1000, 500]);

    let country: String = store
        .connection()
        .query_row("SELECT country FROM tenant3 WHERE id = 2", [], |row| row.get(0))
        .unwrap();
    assert_eq!(Some(country), hash_value(Some("DE"), &salt));

    let err = anonymize(
        &mut store,
        "tenant3",
        &["country".to_string()],
        &salt,
        1000,
        &AnonymizeOptions {
            pk_column: Some("id".to_string()),
            checkpoint: true,
        },
    )
    .unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyAnonymized { .. }));
}

#[test]
fn test_reload_clears_checkpoints() {
    let temp_dir = TempDir::new().unwrap();
    let (pipeline, config) = pipeline_in(&temp_dir);
    std::fs::write(pipeline.tenant_file("tenant4"), tenant_csv(5)).unwrap();
    pipeline.run_tenant("tenant4").unwrap();

    let salt = Salt::new("shuru").unwrap();
    let targets = vec!["country".to_string()];
    let options = AnonymizeOptions {
        pk_column: None,
        checkpoint: true,
    };

    {
        let mut store = Store::open(&config.storage).unwrap();
        anonymize(&mut store, "tenant4", &targets, &salt, 2, &options).unwrap();
    }

    pipeline.run_tenant("tenant4").unwrap();

    let mut store = Store::open(&config.storage).unwrap();
    let report = anonymize(&mut store, "tenant4", &targets, &salt, 2, &options).unwrap();
    assert_eq!(report.rows_updated, 5);
    assert!(report.resumed_from.is_none());
}
