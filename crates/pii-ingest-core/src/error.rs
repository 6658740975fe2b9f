//! Error types for pipeline operations
//!
//! Every variant names the file, table or column involved so a failure can be
//! located without correlating logs.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input header does not match the column contract (exact order)
    #[error("CSV file {} does not match required schema {expected:?} (found {found:?})", .file.display())]
    SchemaMismatch {
        file: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// A column requested for hashing is absent from the table
    #[error("Column '{column}' not found in table '{table}'")]
    MissingColumn { table: String, column: String },

    #[error("Table '{table}' does not exist")]
    TableNotFound { table: String },

    /// SQLite failure, propagated as-is
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Failed to read CSV file {}: {source}", .file.display())]
    Csv {
        file: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// BLOB cells cannot be hashed as a scalar
    #[error("Column '{column}' in table '{table}' holds a non-scalar value and cannot be hashed")]
    NonScalarValue { table: String, column: String },

    /// A checkpointed run over the same columns and salt already completed
    #[error("Columns {columns:?} of table '{table}' were already anonymized with this salt")]
    AlreadyAnonymized { table: String, columns: Vec<String> },

    #[error("Table '{table}' has an anonymization checkpoint made with a different salt")]
    SaltMismatch { table: String },
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn csv(file: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            file: file.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
