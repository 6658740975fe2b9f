//! Typed rows read from tenant input files

use serde::{Deserialize, Serialize};

/// One event row. Only `id` is required; empty cells deserialize to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub user_id: Option<String>,
    pub event_time: Option<String>,
    pub value: Option<f64>,
    pub country: Option<String>,
}

impl Record {
    /// Mutable access to a text column by name, for pseudonymization.
    pub fn text_field_mut(&mut self, column: &str) -> Option<&mut Option<String>> {
        match column {
            "user_id" => Some(&mut self.user_id),
            "event_time" => Some(&mut self.event_time),
            "country" => Some(&mut self.country),
            _ => None,
        }
    }
}
