//! Outgoing Batches and Extract Requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Outgoing batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Being routed
    Routing,
    /// Requested, waiting for extraction
    Request,
    /// Extraction in progress
    Querying,
    /// Extracted and staged, ready to send
    New,
    Sending,
    Loading,
    Ok,
    Ignored,
    Error,
    Resend,
    Unknown,
}

impl BatchStatus {
    /// Two letter status code
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::Routing => "RT",
            BatchStatus::Request => "RQ",
            BatchStatus::Querying => "QY",
            BatchStatus::New => "NE",
            BatchStatus::Sending => "SE",
            BatchStatus::Loading => "LD",
            BatchStatus::Ok => "OK",
            BatchStatus::Ignored => "IG",
            BatchStatus::Error => "ER",
            BatchStatus::Resend => "RS",
            BatchStatus::Unknown => "XX",
        }
    }

    /// Parse a status code, unknown codes map to `Unknown`
    pub fn from_code(code: &str) -> Self {
        match code {
            "RT" => BatchStatus::Routing,
            "RQ" => BatchStatus::Request,
            "QY" => BatchStatus::Querying,
            "NE" => BatchStatus::New,
            "SE" => BatchStatus::Sending,
            "LD" => BatchStatus::Loading,
            "OK" => BatchStatus::Ok,
            "IG" => BatchStatus::Ignored,
            "ER" => BatchStatus::Error,
            "RS" => BatchStatus::Resend,
            _ => BatchStatus::Unknown,
        }
    }

    /// Finished out of band; extracting it any further is pointless
    pub fn is_ok_or_ignored(&self) -> bool {
        matches!(self, BatchStatus::Ok | BatchStatus::Ignored)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// What kind of extraction produced a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchType {
    /// Replay of captured changes
    Extract,
    /// Rows selected from live tables
    Reload,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Extract => "EXTRACT",
            BatchType::Reload => "RELOAD",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("RELOAD") {
            BatchType::Reload
        } else {
            BatchType::Extract
        }
    }
}

/// Batch of change records bound for one node on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub batch_id: i64,
    /// Target node
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    pub batch_type: BatchType,
    pub load_id: Option<i64>,
    pub create_time: DateTime<Utc>,
    pub extract_start_time: Option<DateTime<Utc>>,
    pub data_row_count: u64,
    pub data_insert_row_count: u64,
    pub data_update_row_count: u64,
    pub data_delete_row_count: u64,
    pub other_row_count: u64,
    pub byte_count: u64,
    pub extract_millis: u64,
}

impl OutgoingBatch {
    /// Create a batch in request status
    pub fn new(
        batch_id: i64,
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        batch_type: BatchType,
    ) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status: BatchStatus::Request,
            batch_type,
            load_id: None,
            create_time: Utc::now(),
            extract_start_time: None,
            data_row_count: 0,
            data_insert_row_count: 0,
            data_update_row_count: 0,
            data_delete_row_count: 0,
            other_row_count: 0,
            byte_count: 0,
            extract_millis: 0,
        }
    }

    /// Clear statistics before a (re-)extraction
    pub fn reset_stats(&mut self) {
        self.data_row_count = 0;
        self.data_insert_row_count = 0;
        self.data_update_row_count = 0;
        self.data_delete_row_count = 0;
        self.other_row_count = 0;
        self.byte_count = 0;
        self.extract_millis = 0;
    }

    /// Node id and batch id, used in log lines
    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.node_id, self.batch_id)
    }
}

/// A table to select rows from as part of a reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadTable {
    pub trigger_hist_id: i64,
    pub router_id: String,
    /// Extra predicate restricting the reloaded rows
    pub initial_load_select: Option<String>,
}

/// Request to extract a contiguous range of batches for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub request_id: i64,
    /// Target node
    pub node_id: String,
    pub queue: String,
    pub channel_id: String,
    pub start_batch_id: i64,
    pub end_batch_id: i64,
    pub load_id: Option<i64>,
    /// Tables to extract, in order
    #[serde(default)]
    pub tables: Vec<ReloadTable>,
    /// Sibling requests whose nodes receive identical payloads
    #[serde(default)]
    pub child_requests: Vec<ExtractRequest>,
    pub parent_request_id: Option<i64>,
}

impl ExtractRequest {
    /// Create a request without tables or children
    pub fn new(
        request_id: i64,
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        start_batch_id: i64,
        end_batch_id: i64,
    ) -> Self {
        Self {
            request_id,
            node_id: node_id.into(),
            queue: "reload".to_string(),
            channel_id: channel_id.into(),
            start_batch_id,
            end_batch_id,
            load_id: None,
            tables: Vec::new(),
            child_requests: Vec::new(),
            parent_request_id: None,
        }
    }

    pub fn batch_ids(&self) -> RangeInclusive<i64> {
        self.start_batch_id..=self.end_batch_id
    }

    pub fn batch_count(&self) -> usize {
        (self.end_batch_id - self.start_batch_id + 1).max(0) as usize
    }

    /// Batch id in this request at the same position as `parent_batch_id`
    /// in `parent`
    pub fn corresponding_batch_id(&self, parent: &ExtractRequest, parent_batch_id: i64) -> i64 {
        self.start_batch_id + (parent_batch_id - parent.start_batch_id)
    }
}
