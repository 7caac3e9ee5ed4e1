//! Child Batch Replication
//!
//! Nodes sharing a reload receive byte-identical payloads under their
//! own batch ids. A sealed parent batch is streamed into one staged
//! resource per child with only the `batch` and `commit` lines rewritten.

use chrono::Utc;
use std::io::{BufRead, Write};
use std::sync::Arc;

use super::protocol::{BATCH_TOKEN, COMMIT_TOKEN};
use crate::error::{Error, Result};
use crate::model::{BatchStatus, BatchType, ExtractRequest, OutgoingBatch};
use crate::staging::{ResourceState, StagedResource, StagingManager, OUTGOING};
use crate::store::BatchStore;

/// Copy `reader` to `writer`, replacing the batch id on marker lines
pub fn rewrite_batch_id<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
    source_batch_id: i64,
    target_batch_id: i64,
) -> Result<u64> {
    let source_id = source_batch_id.to_string();
    let mut line = Vec::new();
    let mut written = 0u64;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }

        let rewritten = [BATCH_TOKEN, COMMIT_TOKEN].iter().find_map(|token| {
            let body = line.strip_suffix(b"\n").unwrap_or(&line[..]);
            let rest = body.strip_prefix(token.as_bytes())?.strip_prefix(b",")?;
            (rest == source_id.as_bytes()).then(|| {
                let ending = if body.len() < line.len() { "\n" } else { "" };
                format!("{},{}{}", token, target_batch_id, ending)
            })
        });

        match rewritten {
            Some(marker) => {
                writer.write_all(marker.as_bytes())?;
                written += marker.len() as u64;
            }
            None => {
                writer.write_all(&line)?;
                written += line.len() as u64;
            }
        }
    }

    writer.flush()?;
    Ok(written)
}

/// Replicate a sealed parent batch into the matching batch of a child request
pub fn copy_to_child(
    staging: &StagingManager,
    batch_store: &dyn BatchStore,
    parent_request: &ExtractRequest,
    parent_batch: &OutgoingBatch,
    parent_resource: &Arc<StagedResource>,
    child_request: &ExtractRequest,
) -> Result<OutgoingBatch> {
    let child_batch_id = child_request.corresponding_batch_id(parent_request, parent_batch.batch_id);
    let target = staging
        .create(OUTGOING, &child_request.node_id, child_batch_id)
        .map_err(|e| wrap(parent_batch.batch_id, child_batch_id, e))?;

    let result = copy_into(
        batch_store,
        parent_batch,
        parent_resource,
        &target,
        child_request,
        child_batch_id,
    );

    match result {
        Ok(child) => {
            tracing::info!(
                "Copied batch {} to batch {} ({} bytes)",
                parent_batch.node_batch_id(),
                child.node_batch_id(),
                child.byte_count
            );
            Ok(child)
        }
        Err(e) => {
            if let Err(cleanup) = target.delete() {
                tracing::warn!("Failed to remove partial copy {}: {}", child_batch_id, cleanup);
            }
            Err(wrap(parent_batch.batch_id, child_batch_id, e))
        }
    }
}

fn wrap(source_batch_id: i64, target_batch_id: i64, e: Error) -> Error {
    Error::ChildCopy {
        source_batch_id,
        target_batch_id,
        source: Box::new(e),
    }
}

fn copy_into(
    batch_store: &dyn BatchStore,
    parent_batch: &OutgoingBatch,
    parent_resource: &Arc<StagedResource>,
    target: &Arc<StagedResource>,
    child_request: &ExtractRequest,
    child_batch_id: i64,
) -> Result<OutgoingBatch> {
    let started = Utc::now();
    rewrite_batch_id(
        parent_resource.reader()?,
        target.writer()?,
        parent_batch.batch_id,
        child_batch_id,
    )?;
    target.set_state(ResourceState::Done)?;

    let existing = batch_store.find_batch(child_batch_id, &child_request.node_id)?;
    let mut child = match &existing {
        Some(batch) => batch.clone(),
        None => {
            let mut batch = OutgoingBatch::new(
                child_batch_id,
                child_request.node_id.clone(),
                child_request.channel_id.clone(),
                BatchType::Reload,
            );
            batch.load_id = child_request.load_id;
            batch
        }
    };
    if child.status.is_ok_or_ignored() {
        return Err(Error::Cancelled {
            batch_id: child_batch_id,
        });
    }

    child.data_row_count = parent_batch.data_row_count;
    child.data_insert_row_count = parent_batch.data_insert_row_count;
    child.data_update_row_count = parent_batch.data_update_row_count;
    child.data_delete_row_count = parent_batch.data_delete_row_count;
    child.other_row_count = parent_batch.other_row_count;
    child.byte_count = target.size();
    child.extract_start_time = Some(started);
    child.extract_millis = (Utc::now() - started).num_milliseconds().max(0) as u64;
    child.status = BatchStatus::New;

    match existing {
        Some(_) => batch_store.update_batch(&child)?,
        None => {
            batch_store.insert_batch(&child)?;
            batch_store.update_batch(&child)?;
        }
    }
    Ok(child)
}
