//! Multi-Batch Staging Writer
//!
//! Streams a row source into a run of pre-allocated batches, sealing one
//! and opening the next whenever the row limit is reached while batches
//! remain. Sealed batches are replicated to child requests, and their
//! statistics are written back to the batch store unless the batch was
//! finished out of band in the meantime.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use super::copy::copy_to_child;
use super::protocol::ProtocolWriter;
use crate::config::ExtractSettings;
use crate::error::{Error, Result};
use crate::model::{BatchStatus, ChangeRecord, DataEventType, ExtractRequest, OutgoingBatch};
use crate::source::RowSource;
use crate::staging::{ResourceState, StagedResource, StagedWriter, StagingManager, OUTGOING};
use crate::store::BatchStore;

struct OpenBatch {
    batch: OutgoingBatch,
    resource: Arc<StagedResource>,
    protocol: ProtocolWriter<StagedWriter>,
    started: Instant,
}

/// Progress of one writer, owned and updated only by the writer
#[derive(Debug, Clone, Default)]
pub struct WriterProgress {
    pub rows: u64,
    pub batches_sealed: usize,
    pub children_copied: usize,
}

/// Writes a row source into consecutive staged batches
pub struct MultiBatchStagingWriter {
    settings: ExtractSettings,
    staging: Arc<StagingManager>,
    batch_store: Arc<dyn BatchStore>,
    /// Request whose child requests receive copies of each sealed batch
    request: Option<ExtractRequest>,
    pending: VecDeque<OutgoingBatch>,
    current: Option<OpenBatch>,
    finished: Vec<OutgoingBatch>,
    finished_resources: Vec<Arc<StagedResource>>,
    progress: WriterProgress,
    session_started: Instant,
    last_log: Instant,
}

impl MultiBatchStagingWriter {
    /// Writer over `batches`, which must be in ascending batch id order
    pub fn new(
        settings: ExtractSettings,
        staging: Arc<StagingManager>,
        batch_store: Arc<dyn BatchStore>,
        batches: Vec<OutgoingBatch>,
    ) -> Self {
        let now = Instant::now();
        Self {
            settings,
            staging,
            batch_store,
            request: None,
            pending: batches.into(),
            current: None,
            finished: Vec::new(),
            finished_resources: Vec::new(),
            progress: WriterProgress::default(),
            session_started: now,
            last_log: now,
        }
    }

    /// Copy each sealed batch to the request's child requests
    pub fn with_request(mut self, request: ExtractRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn progress(&self) -> &WriterProgress {
        &self.progress
    }

    /// Drain `source` into the batches. On failure the batch being written
    /// is deleted; batches sealed before the failure stay valid.
    pub fn run(mut self, source: &mut RowSource) -> Result<Vec<OutgoingBatch>> {
        let result = self.write_all(source);
        source.close();

        match result {
            Ok(()) => {
                tracing::info!(
                    "Extracted {} rows into {} batches in {:?}",
                    self.progress.rows,
                    self.progress.batches_sealed,
                    self.session_started.elapsed()
                );
                Ok(self.finished)
            }
            Err(e) => {
                self.rollback(&e);
                Err(e)
            }
        }
    }

    fn write_all(&mut self, source: &mut RowSource) -> Result<()> {
        self.open_next()?;

        while let Some(record) = source.next()? {
            let limit_reached = self
                .current
                .as_ref()
                .map_or(false, |open| open.batch.data_row_count >= self.settings.max_rows_per_batch);
            if limit_reached && !self.pending.is_empty() {
                self.seal_current()?;
                self.open_next()?;
            }

            let table = source
                .target_table()
                .ok_or_else(|| Error::Internal(format!("No table for change {}", record.data_id)))?;
            self.write_record(&record, &table)?;
            self.log_progress();
        }

        self.seal_current()?;
        // Every requested batch id must exist, even without rows
        while !self.pending.is_empty() {
            self.open_next()?;
            self.seal_current()?;
        }
        Ok(())
    }

    fn write_record(&mut self, record: &ChangeRecord, table: &crate::model::Table) -> Result<()> {
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Internal("No batch open for writing".to_string()))?;
        open.protocol.write(record, table)?;

        let batch = &mut open.batch;
        batch.data_row_count += 1;
        match record.event_type {
            DataEventType::Insert => batch.data_insert_row_count += 1,
            DataEventType::Update => batch.data_update_row_count += 1,
            DataEventType::Delete => batch.data_delete_row_count += 1,
            _ => batch.other_row_count += 1,
        }
        self.progress.rows += 1;
        Ok(())
    }

    fn log_progress(&mut self) {
        if self.last_log.elapsed() < self.settings.log_interval {
            return;
        }
        self.last_log = Instant::now();
        if let Some(open) = &self.current {
            tracing::info!(
                "Batch {}: {} rows, {} bytes in {:?}; {} rows total",
                open.batch.node_batch_id(),
                open.batch.data_row_count,
                open.resource.size(),
                open.started.elapsed(),
                self.progress.rows
            );
        }
    }

    fn open_next(&mut self) -> Result<()> {
        let Some(mut batch) = self.pending.pop_front() else {
            return Ok(());
        };

        // Earlier batches of this session are still in flight as a group
        for resource in &self.finished_resources {
            resource.touch();
        }

        if let Some(existing) = self.staging.find(OUTGOING, &batch.node_id, batch.batch_id)? {
            if existing.state() == ResourceState::Done {
                return Err(Error::AlreadyExtracted {
                    batch_id: batch.batch_id,
                });
            }
            tracing::debug!("Removing unfinished staging of batch {}", batch.node_batch_id());
            existing.delete()?;
        }

        let resource = self.staging.create(OUTGOING, &batch.node_id, batch.batch_id)?;
        batch.reset_stats();
        batch.status = BatchStatus::Querying;
        batch.extract_start_time = Some(Utc::now());

        let mut protocol = ProtocolWriter::new(resource.writer()?, self.settings.node_id.clone());
        protocol.start_batch(&batch)?;
        tracing::info!("Extracting batch {}", batch.node_batch_id());

        self.current = Some(OpenBatch {
            batch,
            resource,
            protocol,
            started: Instant::now(),
        });
        Ok(())
    }

    fn seal_current(&mut self) -> Result<()> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };

        if let Err(e) = open.protocol.end_batch(&open.batch) {
            discard(&open);
            return Err(e);
        }
        open.batch.byte_count = open.resource.size();
        open.batch.extract_millis = open.started.elapsed().as_millis() as u64;

        let stored = self.batch_store.find_batch(open.batch.batch_id, &open.batch.node_id)?;
        if let Some(stored) = &stored {
            if stored.status.is_ok_or_ignored() {
                tracing::info!(
                    "Batch {} was marked {} while extracting; stopping",
                    open.batch.node_batch_id(),
                    stored.status
                );
                discard(&open);
                return Err(Error::Cancelled {
                    batch_id: open.batch.batch_id,
                });
            }
        }

        open.batch.status = BatchStatus::New;
        let persisted = match stored {
            Some(_) => self.batch_store.update_batch(&open.batch),
            None => self
                .batch_store
                .insert_batch(&open.batch)
                .and_then(|_| self.batch_store.update_batch(&open.batch)),
        };
        if let Err(e) = persisted {
            discard(&open);
            return Err(e);
        }
        open.resource.set_state(ResourceState::Done)?;

        tracing::info!(
            "Sealed batch {}: {} rows, {} bytes, {} ms",
            open.batch.node_batch_id(),
            open.batch.data_row_count,
            open.batch.byte_count,
            open.batch.extract_millis
        );

        if let Some(request) = &self.request {
            for child in &request.child_requests {
                copy_to_child(
                    &self.staging,
                    self.batch_store.as_ref(),
                    request,
                    &open.batch,
                    &open.resource,
                    child,
                )?;
                self.progress.children_copied += 1;
            }
        }

        self.progress.batches_sealed += 1;
        self.finished_resources.push(open.resource);
        self.finished.push(open.batch);
        Ok(())
    }

    fn rollback(&mut self, error: &Error) {
        let Some(open) = self.current.take() else {
            return;
        };
        if error.is_cancellation() {
            tracing::info!("Extraction of batch {} cancelled", open.batch.node_batch_id());
        } else {
            tracing::error!(
                "Extraction of batch {} failed, discarding staged output: {}",
                open.batch.node_batch_id(),
                error
            );
        }
        discard(&open);
    }
}

/// Drop a batch's staged output, keeping the caller's error as the one reported
fn discard(open: &OpenBatch) {
    if let Err(e) = open.resource.delete() {
        tracing::warn!("Failed to delete staging of batch {}: {}", open.batch.batch_id, e);
    }
}
