//! In-memory stores

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{BatchStore, ChangeLogStore, ConfigurationService, RecordCursor};
use crate::error::{Error, Result};
use crate::model::{ChangeRecord, Node, OutgoingBatch, RouterConfig, TriggerHistory};

/// Batch metadata held in memory
#[derive(Default)]
pub struct MemoryBatchStore {
    batches: RwLock<HashMap<(i64, String), OutgoingBatch>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches for a node, ordered by batch id
    pub fn batches_for_node(&self, node_id: &str) -> Vec<OutgoingBatch> {
        let mut batches: Vec<OutgoingBatch> = self
            .batches
            .read()
            .values()
            .filter(|b| b.node_id == node_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.batch_id);
        batches
    }
}

impl BatchStore for MemoryBatchStore {
    fn find_batch(&self, batch_id: i64, node_id: &str) -> Result<Option<OutgoingBatch>> {
        Ok(self
            .batches
            .read()
            .get(&(batch_id, node_id.to_string()))
            .cloned())
    }

    fn update_batch(&self, batch: &OutgoingBatch) -> Result<()> {
        let mut batches = self.batches.write();
        match batches.get_mut(&(batch.batch_id, batch.node_id.clone())) {
            Some(existing) => {
                *existing = batch.clone();
                Ok(())
            }
            None => Err(Error::BatchNotFound {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
            }),
        }
    }

    fn insert_batch(&self, batch: &OutgoingBatch) -> Result<()> {
        self.batches
            .write()
            .insert((batch.batch_id, batch.node_id.clone()), batch.clone());
        Ok(())
    }
}

/// Change log held in memory
#[derive(Default)]
pub struct MemoryChangeLog {
    records: RwLock<BTreeMap<i64, ChangeRecord>>,
    batches: RwLock<HashMap<i64, Vec<(i64, Option<String>)>>>,
    next_data_id: AtomicU64,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its data id
    pub fn insert(&self, mut record: ChangeRecord) -> i64 {
        let data_id = self.next_data_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        record.data_id = data_id;
        self.records.write().insert(data_id, record);
        data_id
    }

    /// Route a record into a batch through a router
    pub fn assign(&self, batch_id: i64, data_id: i64, router_id: Option<&str>) {
        self.batches
            .write()
            .entry(batch_id)
            .or_default()
            .push((data_id, router_id.map(|r| r.to_string())));
    }
}

impl ChangeLogStore for MemoryChangeLog {
    fn select_data_for_batch(&self, batch_id: i64) -> Result<RecordCursor> {
        let mut events = self
            .batches
            .read()
            .get(&batch_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|(data_id, _)| *data_id);

        let records = self.records.read();
        let selected: Vec<Result<ChangeRecord>> = events
            .into_iter()
            .filter_map(|(data_id, router_id)| {
                records.get(&data_id).map(|record| {
                    let mut record = record.clone();
                    if router_id.is_some() {
                        record.router_id = router_id;
                    }
                    Ok(record)
                })
            })
            .collect();

        Ok(Box::new(selected.into_iter()))
    }
}

/// Trigger and router configuration held in memory.
///
/// Routers saved with [`MemoryConfiguration::save_router`] stay invisible to
/// cached lookups until a lookup asks for a refresh, the way a configuration
/// cache lags behind its table.
#[derive(Default)]
pub struct MemoryConfiguration {
    stored_routers: RwLock<HashMap<String, RouterConfig>>,
    cached_routers: RwLock<HashMap<String, RouterConfig>>,
    histories: RwLock<HashMap<i64, TriggerHistory>>,
    nodes: RwLock<HashMap<String, Node>>,
    refreshes: AtomicU64,
}

impl MemoryConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a router visible to cached lookups right away
    pub fn add_router(&self, router: RouterConfig) {
        self.cached_routers
            .write()
            .insert(router.router_id.clone(), router.clone());
        self.stored_routers
            .write()
            .insert(router.router_id.clone(), router);
    }

    /// Save a router without refreshing the cache
    pub fn save_router(&self, router: RouterConfig) {
        self.stored_routers
            .write()
            .insert(router.router_id.clone(), router);
    }

    pub fn add_trigger_history(&self, history: TriggerHistory) {
        self.histories
            .write()
            .insert(history.trigger_hist_id, history);
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.write().insert(node.node_id.clone(), node);
    }

    /// Number of refreshing router lookups served
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl ConfigurationService for MemoryConfiguration {
    fn get_router(&self, router_id: &str, refresh: bool) -> Option<RouterConfig> {
        if refresh {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let stored = self.stored_routers.read().clone();
            *self.cached_routers.write() = stored;
        }
        self.cached_routers.read().get(router_id).cloned()
    }

    fn get_trigger_history(&self, trigger_hist_id: i64) -> Option<TriggerHistory> {
        self.histories.read().get(&trigger_hist_id).cloned()
    }

    fn get_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().get(node_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchStatus, BatchType, DataEventType};

    #[test]
    fn test_batch_store_update_requires_existing() {
        let store = MemoryBatchStore::new();
        let mut batch = OutgoingBatch::new(10, "nodeB", "default", BatchType::Extract);
        assert!(store.update_batch(&batch).is_err());

        store.insert_batch(&batch).unwrap();
        batch.status = BatchStatus::New;
        store.update_batch(&batch).unwrap();
        let found = store.find_batch(10, "nodeB").unwrap().unwrap();
        assert_eq!(found.status, BatchStatus::New);
        assert!(store.find_batch(10, "nodeC").unwrap().is_none());
    }

    #[test]
    fn test_change_log_orders_by_data_id() {
        let log = MemoryChangeLog::new();
        let first = log.insert(ChangeRecord::new(DataEventType::Insert, "t", 1, "default", None));
        let second = log.insert(ChangeRecord::new(DataEventType::Delete, "t", 1, "default", None));

        log.assign(5, second, Some("r1"));
        log.assign(5, first, Some("r1"));

        let records: Vec<ChangeRecord> = log
            .select_data_for_batch(5)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data_id, first);
        assert_eq!(records[1].event_type, DataEventType::Delete);
        assert_eq!(records[0].router_id.as_deref(), Some("r1"));
        assert_eq!(log.select_data_for_batch(6).unwrap().count(), 0);
    }

    #[test]
    fn test_saved_router_needs_refresh() {
        let config = MemoryConfiguration::new();
        config.save_router(RouterConfig::new("late"));

        assert!(config.get_router("late", false).is_none());
        assert!(config.get_router("late", true).is_some());
        assert!(config.get_router("late", false).is_some());
        assert_eq!(config.refresh_count(), 1);
    }
}
