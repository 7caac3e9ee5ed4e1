//! Trigger History
//!
//! Snapshot of a captured table's shape taken when its capture trigger
//! was installed. Change records point at the history that captured them,
//! never at the live table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable capture-time table shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerHistory {
    pub trigger_hist_id: i64,
    pub trigger_id: String,
    pub source_catalog_name: Option<String>,
    pub source_schema_name: Option<String>,
    pub source_table_name: String,
    /// Captured columns, in capture order
    pub column_names: Vec<String>,
    pub pk_column_names: Vec<String>,
    pub create_time: DateTime<Utc>,
}

impl TriggerHistory {
    /// Create a history for a table without catalog or schema
    pub fn new(
        trigger_hist_id: i64,
        trigger_id: impl Into<String>,
        source_table_name: impl Into<String>,
        column_names: &[&str],
        pk_column_names: &[&str],
    ) -> Self {
        Self {
            trigger_hist_id,
            trigger_id: trigger_id.into(),
            source_catalog_name: None,
            source_schema_name: None,
            source_table_name: source_table_name.into(),
            column_names: column_names.iter().map(|c| c.to_string()).collect(),
            pk_column_names: pk_column_names.iter().map(|c| c.to_string()).collect(),
            create_time: Utc::now(),
        }
    }

    pub fn column_count(&self) -> usize {
        self.column_names.len()
    }

    /// Source table name qualified by catalog and schema
    pub fn fully_qualified_table_name(&self) -> String {
        let mut parts = Vec::new();
        if let Some(catalog) = &self.source_catalog_name {
            parts.push(catalog.as_str());
        }
        if let Some(schema) = &self.source_schema_name {
            parts.push(schema.as_str());
        }
        parts.push(self.source_table_name.as_str());
        parts.join(".")
    }
}
