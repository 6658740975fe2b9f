//! Input column contract and header validation

use crate::error::{PipelineError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Column contract for tenant input files, in the order they must appear.
pub const EXPECTED_COLUMNS: [&str; 5] = ["id", "user_id", "event_time", "value", "country"];

pub fn expected_columns() -> Vec<String> {
    EXPECTED_COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// Read only the header row of a CSV file. Cells are kept byte for byte, since
/// records are later deserialized by these exact names.
pub fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| PipelineError::csv(path, e))?;

    let headers = reader.headers().map_err(|e| PipelineError::csv(path, e))?;
    let columns: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    debug!("Read header of {}: {:?}", path.display(), columns);
    Ok(columns)
}

/// Exact, order-sensitive comparison of a file's columns against a contract.
pub fn validate_columns(file: &Path, found: &[String], expected: &[String]) -> Result<()> {
    if found != expected {
        return Err(PipelineError::SchemaMismatch {
            file: file.to_path_buf(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}

/// Validate a tenant input file against [`EXPECTED_COLUMNS`].
pub fn validate_schema(path: &Path) -> Result<PathBuf> {
    let found = read_header(path)?;
    validate_columns(path, &found, &expected_columns())?;
    info!("Schema validation passed for {}", path.display());
    Ok(path.to_path_buf())
}
