//! Data Extraction
//!
//! Entry points that turn an extract request or a single routed batch into
//! staged batch payloads. Each call is one session: it builds its own
//! schema cache, row source and staging writer, and runs to completion on
//! the calling thread. Sessions on the same request or batch are
//! serialized through the process-wide lock registry.

use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExtractSettings;
use crate::error::{Error, Result};
use crate::lock::{LockRegistry, NamedMutex};
use crate::model::{BatchType, ExtractRequest, Node, OutgoingBatch, RouterConfig};
use crate::platform::Platform;
use crate::schema::SchemaReconciler;
use crate::source::{ChangeLogSource, ReloadEvent, RowSource, SourceContext, TableSource};
use crate::staging::{ResourceState, StagingManager, OUTGOING};
use crate::store::{BatchStore, ChangeLogStore, ConfigurationService, DataRouter};
use crate::writer::MultiBatchStagingWriter;

/// Extracts reload requests and routed batches into staging
pub struct DataExtractor {
    platform: Arc<dyn Platform>,
    target_platform: Option<Arc<dyn Platform>>,
    config: Arc<dyn ConfigurationService>,
    batch_store: Arc<dyn BatchStore>,
    change_log: Arc<dyn ChangeLogStore>,
    staging: Arc<StagingManager>,
    settings: ExtractSettings,
    data_router: Option<Arc<dyn DataRouter>>,
    locks: Arc<LockRegistry<String>>,
    lock_timeout: Option<Duration>,
}

impl DataExtractor {
    pub fn new(
        platform: Arc<dyn Platform>,
        config: Arc<dyn ConfigurationService>,
        batch_store: Arc<dyn BatchStore>,
        change_log: Arc<dyn ChangeLogStore>,
        staging: Arc<StagingManager>,
        settings: ExtractSettings,
    ) -> Self {
        Self {
            platform,
            target_platform: None,
            config,
            batch_store,
            change_log,
            staging,
            settings,
            data_router: None,
            locks: LockRegistry::global(),
            lock_timeout: None,
        }
    }

    /// Describe target-side tables through a different platform
    pub fn with_target_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.target_platform = Some(platform);
        self
    }

    /// Filter reloaded rows through a routing decision
    pub fn with_data_router(mut self, router: Arc<dyn DataRouter>) -> Self {
        self.data_router = Some(router);
        self
    }

    /// Fail with `LockTimeout` instead of waiting indefinitely for another
    /// session on the same request or batch
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn settings(&self) -> &ExtractSettings {
        &self.settings
    }

    pub fn staging(&self) -> &Arc<StagingManager> {
        &self.staging
    }

    /// Extract the tables of a reload request into `batches`, copying each
    /// sealed batch to the request's children. With no batches given, the
    /// request's batch id range is used.
    pub fn extract(
        &self,
        request: &ExtractRequest,
        source_node_id: &str,
        batches: Vec<OutgoingBatch>,
    ) -> Result<Vec<OutgoingBatch>> {
        let lock = self.locks.acquire(format!("request-{}", request.request_id));
        let _guard = self.guard(&lock)?;

        let mut settings = self.settings.clone();
        settings.node_id = source_node_id.to_string();

        let batches = self.batches_for(request, batches)?;
        let events = self.reload_events(request)?;
        tracing::info!(
            "Extracting request {} for node {}: {} tables into batches {}-{}",
            request.request_id,
            request.node_id,
            events.len(),
            request.start_batch_id,
            request.end_batch_id
        );

        let ctx = self.context(settings.clone(), &request.node_id);
        let mut source: RowSource = TableSource::new(ctx, request.channel_id.clone(), events).into();

        MultiBatchStagingWriter::new(settings, Arc::clone(&self.staging), Arc::clone(&self.batch_store), batches)
            .with_request(request.clone())
            .run(&mut source)
    }

    /// Extract the routed changes of one batch. A batch already staged as
    /// done is returned as it is.
    pub fn extract_batch(&self, batch: OutgoingBatch) -> Result<OutgoingBatch> {
        let lock = self
            .locks
            .acquire(format!("batch-{}-{}", batch.node_id, batch.batch_id));
        let _guard = self.guard(&lock)?;

        if let Some(resource) = self.staging.find(OUTGOING, &batch.node_id, batch.batch_id)? {
            if resource.state() == ResourceState::Done {
                tracing::info!("Batch {} was previously extracted", batch.node_batch_id());
                resource.touch();
                return Ok(self
                    .batch_store
                    .find_batch(batch.batch_id, &batch.node_id)?
                    .unwrap_or(batch));
            }
        }

        let cursor = self.change_log.select_data_for_batch(batch.batch_id)?;
        let ctx = self.context(self.settings.clone(), &batch.node_id);
        let mut source: RowSource = ChangeLogSource::new(ctx, batch.clone(), cursor).into();

        let batch_id = batch.batch_id;
        MultiBatchStagingWriter::new(
            self.settings.clone(),
            Arc::clone(&self.staging),
            Arc::clone(&self.batch_store),
            vec![batch],
        )
        .run(&mut source)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Internal(format!("Batch {} was not sealed", batch_id)))
    }

    /// Run [`extract`](Self::extract) on the blocking thread pool
    pub async fn extract_async(
        self: &Arc<Self>,
        request: ExtractRequest,
        source_node_id: String,
        batches: Vec<OutgoingBatch>,
    ) -> Result<Vec<OutgoingBatch>> {
        let extractor = Arc::clone(self);
        tokio::task::spawn_blocking(move || extractor.extract(&request, &source_node_id, batches))
            .await
            .map_err(|e| Error::Internal(format!("Extraction task failed: {}", e)))?
    }

    /// Run [`extract_batch`](Self::extract_batch) on the blocking thread pool
    pub async fn extract_batch_async(self: &Arc<Self>, batch: OutgoingBatch) -> Result<OutgoingBatch> {
        let extractor = Arc::clone(self);
        tokio::task::spawn_blocking(move || extractor.extract_batch(batch))
            .await
            .map_err(|e| Error::Internal(format!("Extraction task failed: {}", e)))?
    }

    fn guard<'a>(&self, lock: &'a NamedMutex<String>) -> Result<MutexGuard<'a, ()>> {
        match self.lock_timeout {
            Some(timeout) => lock
                .try_lock_for(timeout)
                .ok_or_else(|| Error::LockTimeout(lock.key().clone())),
            None => Ok(lock.lock()),
        }
    }

    fn target_node(&self, node_id: &str) -> Node {
        self.config
            .get_node(node_id)
            .unwrap_or_else(|| Node::new(node_id, "", node_id))
    }

    fn context(&self, settings: ExtractSettings, target_node_id: &str) -> SourceContext {
        let mut reconciler = SchemaReconciler::new(
            Arc::clone(&self.platform),
            Arc::clone(&self.config),
            settings,
            self.target_node(target_node_id),
        );
        if let Some(platform) = &self.target_platform {
            reconciler = reconciler.with_target_platform(Arc::clone(platform));
        }

        let ctx = SourceContext::new(Arc::new(reconciler), Arc::clone(&self.config));
        match &self.data_router {
            Some(router) => ctx.with_data_router(Arc::clone(router)),
            None => ctx,
        }
    }

    fn batches_for(&self, request: &ExtractRequest, mut batches: Vec<OutgoingBatch>) -> Result<Vec<OutgoingBatch>> {
        if batches.is_empty() {
            for batch_id in request.batch_ids() {
                let batch = match self.batch_store.find_batch(batch_id, &request.node_id)? {
                    Some(batch) => batch,
                    None => {
                        let mut batch = OutgoingBatch::new(
                            batch_id,
                            request.node_id.clone(),
                            request.channel_id.clone(),
                            BatchType::Reload,
                        );
                        batch.load_id = request.load_id;
                        batch
                    }
                };
                batches.push(batch);
            }
        }
        batches.sort_by_key(|batch| batch.batch_id);
        Ok(batches)
    }

    fn reload_events(&self, request: &ExtractRequest) -> Result<Vec<ReloadEvent>> {
        request
            .tables
            .iter()
            .map(|table| {
                let history = self
                    .config
                    .get_trigger_history(table.trigger_hist_id)
                    .ok_or_else(|| {
                        Error::Schema(format!(
                            "No trigger history {} for request {}",
                            table.trigger_hist_id, request.request_id
                        ))
                    })?;
                let router = self
                    .config
                    .get_router(&table.router_id, false)
                    .unwrap_or_else(|| RouterConfig::new(table.router_id.clone()));
                Ok(ReloadEvent {
                    history,
                    router,
                    initial_load_select: table.initial_load_select.clone(),
                })
            })
            .collect()
    }
}
