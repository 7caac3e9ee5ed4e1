//! Batch Writers
//!
//! Encoding of change records into the batch payload, the staging writer
//! that splits a row source across batches, and replication of sealed
//! batches to child requests.

mod copy;
mod protocol;
mod staging;

pub use copy::{copy_to_child, rewrite_batch_id};
pub use protocol::{ProtocolWriter, BATCH_TOKEN, COMMIT_TOKEN};
pub use staging::{MultiBatchStagingWriter, WriterProgress};
