//! Collaborator Stores
//!
//! Contracts for the services extraction reads from and reports to:
//! batch metadata, the change log, trigger/router configuration and the
//! routing decision. In-memory implementations back tests and embedded
//! use; batch metadata can also be kept in SQLite.

mod memory;
mod router;
mod sqlite;

pub use memory::{MemoryBatchStore, MemoryChangeLog, MemoryConfiguration};
pub use router::{ColumnMatchDataRouter, DefaultDataRouter};
pub use sqlite::SqliteBatchStore;

use std::collections::HashSet;

use crate::error::Result;
use crate::model::{ChangeRecord, Node, OutgoingBatch, RouterConfig, Table, TriggerHistory};

/// Forward-only cursor over change log records
pub type RecordCursor = Box<dyn Iterator<Item = Result<ChangeRecord>> + Send>;

/// Batch metadata persistence
pub trait BatchStore: Send + Sync {
    /// Current state of a batch
    fn find_batch(&self, batch_id: i64, node_id: &str) -> Result<Option<OutgoingBatch>>;

    /// Persist statistics and status of an existing batch
    fn update_batch(&self, batch: &OutgoingBatch) -> Result<()>;

    /// Persist a new batch
    fn insert_batch(&self, batch: &OutgoingBatch) -> Result<()>;
}

/// Captured, already routed changes
pub trait ChangeLogStore: Send + Sync {
    /// Records assigned to a batch, in change log order
    fn select_data_for_batch(&self, batch_id: i64) -> Result<RecordCursor>;
}

/// Read access to trigger and router configuration
pub trait ConfigurationService: Send + Sync {
    /// Look up a router. With `refresh` the configuration is re-read
    /// instead of served from cache.
    fn get_router(&self, router_id: &str, refresh: bool) -> Option<RouterConfig>;

    fn get_trigger_history(&self, trigger_hist_id: i64) -> Option<TriggerHistory>;

    fn get_node(&self, node_id: &str) -> Option<Node>;
}

/// Inputs to a routing decision
#[derive(Debug, Clone, Copy)]
pub struct RoutingContext<'a> {
    pub source_node_id: &'a str,
    pub channel_id: &'a str,
    pub router: &'a RouterConfig,
}

/// Decides which nodes a row goes to
pub trait DataRouter: Send + Sync {
    /// Subset of `candidates` (by node id) that should receive the row
    fn route_to_nodes(
        &self,
        ctx: &RoutingContext<'_>,
        record: &ChangeRecord,
        table: &Table,
        candidates: &[Node],
    ) -> Result<HashSet<String>>;
}
