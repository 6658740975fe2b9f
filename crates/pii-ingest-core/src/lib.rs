pub mod anonymizer;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hasher;
pub mod loader;
pub mod pipeline;
pub mod record;
pub mod schema;
pub mod store;

pub use anonymizer::{anonymize, AnonymizationReport, AnonymizeOptions, BatchAnonymizer};
pub use config::{Config, IngestConfig, PseudonymizationConfig, StorageConfig};
pub use error::{PipelineError, Result};
pub use hasher::{hash_sql_value, hash_value, Salt};
pub use loader::{load_and_pseudonymize, pseudonymize};
pub use pipeline::{PipelineSummary, TenantFailure, TenantPipeline, TenantReport};
pub use record::Record;
pub use schema::{expected_columns, read_header, validate_columns, validate_schema, EXPECTED_COLUMNS};
pub use store::{ColumnInfo, Store};
