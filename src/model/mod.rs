//! Data Model
//!
//! Change records, table shapes, batches and the configuration objects
//! the extraction pipeline reads.

pub mod csv;
mod batch;
mod data;
mod history;
mod node;
mod table;

pub use batch::{BatchStatus, BatchType, ExtractRequest, OutgoingBatch, ReloadTable};
pub use data::{ChangeRecord, DataEventType};
pub use history::TriggerHistory;
pub use node::{Node, RouterConfig, DEFAULT_ROUTER_TYPE, NONE_TOKEN};
pub use table::{
    quote_identifier, Column, ColumnType, ForeignKey, Index, Reference, SelfReference, Table,
};
