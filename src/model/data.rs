//! Change Record Types
//!
//! A change record is one captured or extracted row event, carrying its
//! values as delimited text together with the trigger history that
//! describes the table shape at capture time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::csv;
use crate::error::{Error, Result};

/// Kind of row event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataEventType {
    Insert,
    Update,
    Delete,
    /// Re-select rows from the live table instead of replaying values
    Reload,
    Sql,
    /// Table definition, regenerated at extract time when empty
    Create,
    Script,
}

impl DataEventType {
    /// Single letter code as stored in the change log
    pub fn code(&self) -> &'static str {
        match self {
            DataEventType::Insert => "I",
            DataEventType::Update => "U",
            DataEventType::Delete => "D",
            DataEventType::Reload => "R",
            DataEventType::Sql => "S",
            DataEventType::Create => "C",
            DataEventType::Script => "B",
        }
    }

    /// Parse a change log event code
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "I" => Ok(DataEventType::Insert),
            "U" => Ok(DataEventType::Update),
            "D" => Ok(DataEventType::Delete),
            "R" => Ok(DataEventType::Reload),
            "S" => Ok(DataEventType::Sql),
            "C" => Ok(DataEventType::Create),
            "B" => Ok(DataEventType::Script),
            other => Err(Error::ProtocolViolation(format!(
                "Unknown event type code '{}'",
                other
            ))),
        }
    }

    /// Whether the event carries a full row image
    pub fn is_dml_with_row(&self) -> bool {
        matches!(self, DataEventType::Insert | DataEventType::Update)
    }
}

impl std::fmt::Display for DataEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataEventType::Insert => "INSERT",
            DataEventType::Update => "UPDATE",
            DataEventType::Delete => "DELETE",
            DataEventType::Reload => "RELOAD",
            DataEventType::Sql => "SQL",
            DataEventType::Create => "CREATE",
            DataEventType::Script => "SCRIPT",
        };
        write!(f, "{}", name)
    }
}

/// One captured or extracted row event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position in the change log (0 for rows selected from a table)
    pub data_id: i64,
    pub event_type: DataEventType,
    /// Source table name as captured
    pub table_name: String,
    /// New row values, delimited text
    pub row_data: Option<String>,
    /// Primary key values, delimited text
    pub pk_data: Option<String>,
    /// Previous row values, delimited text
    pub old_data: Option<String>,
    /// Trigger history that captured this row
    pub trigger_hist_id: i64,
    pub channel_id: String,
    /// Router the change was routed through
    pub router_id: Option<String>,
    pub external_data: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
    /// Set on rows extracted in a large-object pass
    #[serde(default)]
    pub contains_big_lob: bool,
}

impl ChangeRecord {
    /// Create a record with the given event type and row data
    pub fn new(
        event_type: DataEventType,
        table_name: impl Into<String>,
        trigger_hist_id: i64,
        channel_id: impl Into<String>,
        row_data: Option<String>,
    ) -> Self {
        Self {
            data_id: 0,
            event_type,
            table_name: table_name.into(),
            row_data,
            pk_data: None,
            old_data: None,
            trigger_hist_id,
            channel_id: channel_id.into(),
            router_id: None,
            external_data: None,
            create_time: None,
            contains_big_lob: false,
        }
    }

    /// Stand-in for a row that was too large to extract
    pub fn oversized_row_sentinel(
        table_name: impl Into<String>,
        trigger_hist_id: i64,
        channel_id: impl Into<String>,
    ) -> Self {
        Self::new(DataEventType::Sql, table_name, trigger_hist_id, channel_id, None)
    }

    pub fn with_data_id(mut self, data_id: i64) -> Self {
        self.data_id = data_id;
        self
    }

    pub fn with_pk_data(mut self, pk_data: Option<String>) -> Self {
        self.pk_data = pk_data;
        self
    }

    pub fn with_old_data(mut self, old_data: Option<String>) -> Self {
        self.old_data = old_data;
        self
    }

    pub fn with_router(mut self, router_id: impl Into<String>) -> Self {
        self.router_id = Some(router_id.into());
        self
    }

    /// Parsed new row values (empty when the record carries none)
    pub fn parsed_row_data(&self) -> Result<Vec<Option<String>>> {
        parse_optional(self.row_data.as_deref())
    }

    /// Parsed primary key values
    pub fn parsed_pk_data(&self) -> Result<Vec<Option<String>>> {
        parse_optional(self.pk_data.as_deref())
    }

    /// Parsed previous row values
    pub fn parsed_old_data(&self) -> Result<Vec<Option<String>>> {
        parse_optional(self.old_data.as_deref())
    }
}

fn parse_optional(data: Option<&str>) -> Result<Vec<Option<String>>> {
    match data {
        Some(line) => csv::parse(line),
        None => Ok(Vec::new()),
    }
}
