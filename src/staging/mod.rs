//! Staging Area
//!
//! Holds each batch's serialized payload between extraction and
//! transport. Resources are addressed by (category, location, batch id)
//! and laid out on disk as `dir/category/location/<batch id>.<state>`.

mod resource;

pub use resource::{ResourceState, StagedResource, StagedWriter};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::StagingConfig;
use crate::error::Result;

/// Category of resources holding outgoing batches
pub const OUTGOING: &str = "outgoing";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    category: String,
    location: String,
    batch_id: i64,
}

/// Creates, finds and purges staged resources
pub struct StagingManager {
    dir: PathBuf,
    memory_threshold: usize,
    resources: Mutex<HashMap<ResourceKey, Arc<StagedResource>>>,
}

impl StagingManager {
    pub fn new(dir: impl Into<PathBuf>, memory_threshold: usize) -> Self {
        Self {
            dir: dir.into(),
            memory_threshold,
            resources: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &StagingConfig) -> Self {
        Self::new(config.dir.clone(), config.memory_threshold_bytes)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn base_path(&self, category: &str, location: &str, batch_id: i64) -> PathBuf {
        self.dir
            .join(category)
            .join(location)
            .join(format!("{:020}", batch_id))
    }

    fn key(category: &str, location: &str, batch_id: i64) -> ResourceKey {
        ResourceKey {
            category: category.to_string(),
            location: location.to_string(),
            batch_id,
        }
    }

    /// Create a fresh resource, replacing any earlier one at the same address
    pub fn create(&self, category: &str, location: &str, batch_id: i64) -> Result<Arc<StagedResource>> {
        let key = Self::key(category, location, batch_id);
        let resource = Arc::new(StagedResource::new(
            category,
            location,
            batch_id,
            self.base_path(category, location, batch_id),
            self.memory_threshold,
        ));

        let previous = self.resources.lock().insert(key, Arc::clone(&resource));
        if let Some(previous) = previous {
            previous.delete()?;
        }
        Ok(resource)
    }

    /// Find a live resource, including sealed ones left on disk by an
    /// earlier process
    pub fn find(&self, category: &str, location: &str, batch_id: i64) -> Result<Option<Arc<StagedResource>>> {
        let key = Self::key(category, location, batch_id);
        let mut resources = self.resources.lock();
        if let Some(resource) = resources.get(&key) {
            if !resource.is_deleted() {
                return Ok(Some(Arc::clone(resource)));
            }
            resources.remove(&key);
        }

        let base_path = self.base_path(category, location, batch_id);
        if !base_path.with_extension("done").exists() {
            return Ok(None);
        }
        let resource = Arc::new(StagedResource::existing_done(
            category,
            location,
            batch_id,
            base_path,
            self.memory_threshold,
        )?);
        resources.insert(key, Arc::clone(&resource));
        Ok(Some(resource))
    }

    /// All live resources
    pub fn resources(&self) -> Vec<Arc<StagedResource>> {
        self.resources
            .lock()
            .values()
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect()
    }

    /// Purge DONE resources not updated within `ttl`
    pub fn clean(&self, ttl: Duration) -> Result<usize> {
        let cutoff = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        match cutoff {
            Some(cutoff) => self.clean_older_than(cutoff),
            // Nothing can be older than that
            None => Ok(0),
        }
    }

    /// Purge DONE resources last updated before `cutoff`
    pub fn clean_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut resources = self.resources.lock();
        let expired: Vec<ResourceKey> = resources
            .iter()
            .filter(|(_, r)| {
                r.is_deleted() || (r.state() == ResourceState::Done && r.last_update() < cutoff)
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut purged = 0;
        for key in expired {
            if let Some(resource) = resources.remove(&key) {
                if !resource.is_deleted() {
                    resource.delete()?;
                    purged += 1;
                }
            }
        }

        if purged > 0 {
            tracing::info!("Purged {} staged resources", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_find() {
        let dir = tempdir().unwrap();
        let staging = StagingManager::new(dir.path(), 1024);
        let resource = staging.create(OUTGOING, "nodeB", 1001).unwrap();
        resource.writer().unwrap().write_all(b"batch,1001\n").unwrap();

        let found = staging.find(OUTGOING, "nodeB", 1001).unwrap().unwrap();
        assert!(Arc::ptr_eq(&resource, &found));
        assert!(staging.find(OUTGOING, "nodeC", 1001).unwrap().is_none());

        resource.delete().unwrap();
        assert!(staging.find(OUTGOING, "nodeB", 1001).unwrap().is_none());
    }

    #[test]
    fn test_find_done_resource_on_disk() {
        let dir = tempdir().unwrap();
        {
            let staging = StagingManager::new(dir.path(), 4);
            let resource = staging.create(OUTGOING, "nodeB", 5).unwrap();
            resource.writer().unwrap().write_all(b"batch,5\ncommit,5\n").unwrap();
            resource.set_state(ResourceState::Done).unwrap();
        }

        let staging = StagingManager::new(dir.path(), 4);
        let found = staging.find(OUTGOING, "nodeB", 5).unwrap().unwrap();
        assert_eq!(found.state(), ResourceState::Done);
        assert_eq!(found.size(), 17);
        assert_eq!(found.read_to_string().unwrap(), "batch,5\ncommit,5\n");
    }

    #[test]
    fn test_clean_spares_touched_resources() {
        let dir = tempdir().unwrap();
        let staging = StagingManager::new(dir.path(), 1024);
        let old = staging.create(OUTGOING, "nodeB", 1).unwrap();
        old.set_state(ResourceState::Done).unwrap();
        let in_progress = staging.create(OUTGOING, "nodeB", 2).unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(staging.clean_older_than(cutoff).unwrap(), 1);
        assert!(old.is_deleted());
        assert!(!in_progress.is_deleted());

        let kept = staging.create(OUTGOING, "nodeB", 3).unwrap();
        kept.set_state(ResourceState::Done).unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        kept.touch();
        assert_eq!(staging.clean(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(staging.clean_older_than(cutoff).unwrap(), 0);
        assert_eq!(staging.resources().len(), 2);
    }
}
