//! Salted one-way hashing of identifying values
//!
//! Digests are SHA-256 over `salt ++ value`, rendered as lowercase hex. The
//! transform is deterministic so pseudonyms produced with the same salt can be
//! joined across runs and tenants.

use crate::error::{PipelineError, Result};
use rusqlite::types::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Process-wide salt mixed into every digest.
///
/// Always carried explicitly; mixing salts over one column produces
/// inconsistent pseudonyms.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt(String);

impl Salt {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(PipelineError::configuration("salt must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short identifier stored alongside checkpoints; does not reveal the salt.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        format!("{digest:x}")[..16].to_string()
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Salt").field(&"***").finish()
    }
}

/// Hash a single value. `None` passes through untouched.
pub fn hash_value(value: Option<&str>, salt: &Salt) -> Option<String> {
    value.map(|v| digest(v, salt))
}

/// Hash a stored cell. NULL stays NULL, numbers are hashed over their text
/// form and BLOBs are rejected.
pub fn hash_sql_value(value: &Value, salt: &Salt, table: &str, column: &str) -> Result<Value> {
    let text = match value {
        Value::Null => return Ok(Value::Null),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => real_text(*r),
        Value::Text(t) => t.clone(),
        Value::Blob(_) => {
            return Err(PipelineError::NonScalarValue {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    };
    Ok(Value::Text(digest(&text, salt)))
}

fn digest(value: &str, salt: &Salt) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_str().as_bytes());
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

// Shortest round-trip digits. Whole numbers keep their ".0" so 42.0 and 42
// hash differently; magnitudes outside [1e-4, 1e16) use a signed two-digit
// exponent ("1e+20", "1.5e-05").
fn real_text(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let scientific = format!("{value:e}");
    if let Some((mantissa, exponent)) = scientific.split_once('e') {
        if let Ok(exponent) = exponent.parse::<i32>() {
            if value != 0.0 && !(-4..16).contains(&exponent) {
                let sign = if exponent < 0 { '-' } else { '+' };
                return format!("{}e{}{:02}", mantissa, sign, exponent.abs());
            }
        }
    }

    let decimal = value.to_string();
    if decimal.contains('.') {
        decimal
    } else {
        format!("{decimal}.0")
    }
}
