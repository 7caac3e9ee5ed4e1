//! WolfBatch - Change Extraction and Batch Staging
//!
//! The extraction core of a database replication engine. Changes captured
//! on a source node are read back from the change log, or whole tables are
//! selected for a reload, and written into bounded, numbered batches that
//! are staged for delivery to target nodes.
//!
//! # Architecture
//!
//! A session pulls change records from a row source and hands them to a
//! staging writer. The row source reconciles every record against the live
//! table shape and the router's target naming; the writer encodes records
//! into the batch payload, splits across pre-allocated batch ids and seals
//! each batch before the transport layer may pick it up.
//!
//! # Features
//!
//! - Parent-first ordering of self-referencing tables during reloads
//! - Two-pass extraction of large-object columns
//! - Row-size guard with sentinel events for oversized rows
//! - Child batch replication with batch id rewriting
//! - Out-of-band cancellation detected at batch seal time
//! - Named locks serializing sessions on the same request or batch

pub mod config;
pub mod error;
pub mod extract;
pub mod lock;
pub mod logging;
pub mod model;
pub mod platform;
pub mod schema;
pub mod source;
pub mod staging;
pub mod store;
pub mod writer;

pub use config::WolfBatchConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ExtractSettings, WolfBatchConfig};
    pub use crate::error::{Error, Result};
    pub use crate::extract::DataExtractor;
    pub use crate::model::{ChangeRecord, DataEventType, ExtractRequest, OutgoingBatch};
    pub use crate::source::RowSource;
    pub use crate::staging::StagingManager;
    pub use crate::writer::MultiBatchStagingWriter;
}
