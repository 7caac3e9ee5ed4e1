//! Change-Log Source
//!
//! Replays the captured changes of one batch in change log order.
//! Reload markers are expanded in place by a nested table source, empty
//! CREATE events get a freshly generated table definition, and records
//! whose router can no longer be found are skipped and counted.

use std::collections::HashMap;
use std::sync::Arc;

use super::sql::primary_key_predicate;
use super::table::{ReloadEvent, TableSource};
use super::{Pull, SourceContext};
use crate::error::{Error, Result};
use crate::model::{ChangeRecord, DataEventType, OutgoingBatch, RouterConfig, Table, TriggerHistory};
use crate::schema::{table_definition, ResolveFlags};
use crate::store::RecordCursor;

/// Tables resolved for the previous record
struct Resolved {
    trigger_hist_id: i64,
    router_id: String,
    history: TriggerHistory,
    router: RouterConfig,
    source: Arc<Table>,
    target: Arc<Table>,
}

/// Row source over the change log of one batch
pub struct ChangeLogSource {
    ctx: SourceContext,
    batch: OutgoingBatch,
    cursor: RecordCursor,
    nested: Option<TableSource>,
    last: Option<Resolved>,
    /// Records skipped for want of a router, by trigger history id
    missing_routers: HashMap<i64, u64>,
    source_table: Option<Arc<Table>>,
    target_table: Option<Arc<Table>>,
}

impl ChangeLogSource {
    pub fn new(ctx: SourceContext, batch: OutgoingBatch, cursor: RecordCursor) -> Self {
        Self {
            ctx,
            batch,
            cursor,
            nested: None,
            last: None,
            missing_routers: HashMap::new(),
            source_table: None,
            target_table: None,
        }
    }

    /// Next record of the batch
    pub fn next(&mut self) -> Result<Option<ChangeRecord>> {
        loop {
            match self.pull()? {
                Pull::Record(record) => return Ok(Some(record)),
                Pull::Skip => continue,
                Pull::End => return Ok(None),
            }
        }
    }

    pub fn source_table(&self) -> Option<Arc<Table>> {
        self.source_table.clone()
    }

    pub fn target_table(&self) -> Option<Arc<Table>> {
        self.target_table.clone()
    }

    /// Number of records skipped because their router was missing
    pub fn skipped_records(&self) -> u64 {
        self.missing_routers.values().sum()
    }

    pub fn close(&mut self) {
        if let Some(mut nested) = self.nested.take() {
            nested.close();
        }
        if self.missing_routers.is_empty() {
            return;
        }

        let mut summary: Vec<(i64, u64)> = self.missing_routers.iter().map(|(k, v)| (*k, *v)).collect();
        summary.sort();
        let details = summary
            .iter()
            .map(|(hist, count)| format!("trigger history {}: {}", hist, count))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::warn!(
            "Batch {} skipped {} records whose router could not be found ({})",
            self.batch.node_batch_id(),
            self.skipped_records(),
            details
        );
    }

    pub(crate) fn pull(&mut self) -> Result<Pull> {
        if let Some(nested) = self.nested.as_mut() {
            match nested.next()? {
                Some(record) => {
                    self.source_table = nested.source_table();
                    self.target_table = nested.target_table();
                    return Ok(Pull::Record(record));
                }
                None => {
                    nested.close();
                    self.nested = None;
                }
            }
        }

        let mut record = match self.cursor.next() {
            Some(record) => record?,
            None => return Ok(Pull::End),
        };

        if !self.resolve_tables(&record)? {
            return Ok(Pull::Skip);
        }
        let Some(resolved) = self.last.as_ref() else {
            return Ok(Pull::Skip);
        };

        match record.event_type {
            DataEventType::Reload => {
                let event = ReloadEvent {
                    initial_load_select: self.reload_predicate(&record, &resolved.history)?,
                    history: resolved.history.clone(),
                    router: resolved.router.clone(),
                };
                tracing::debug!(
                    "Batch {} reloads {}",
                    self.batch.node_batch_id(),
                    resolved.history.fully_qualified_table_name()
                );
                self.nested = Some(TableSource::new(
                    self.ctx.clone(),
                    record.channel_id.clone(),
                    vec![event],
                ));
                return Ok(Pull::Skip);
            }
            DataEventType::Create if is_blank(record.row_data.as_deref()) => {
                let reconciler = &self.ctx.reconciler;
                reconciler.invalidate();
                let table = reconciler.refresh(
                    &resolved.router_id,
                    &resolved.history,
                    ResolveFlags::live().with_target_name(),
                )?;
                record.row_data = Some(table_definition(
                    &table,
                    reconciler.settings().definition_options,
                )?);
            }
            DataEventType::Insert | DataEventType::Update => {
                let fields = record.parsed_row_data()?.len();
                let expected = resolved.history.column_count();
                if fields != expected {
                    let mut message = format!(
                        "Change {} of {} has {} values but trigger history {} records {} columns",
                        record.data_id,
                        resolved.history.fully_qualified_table_name(),
                        fields,
                        resolved.trigger_hist_id,
                        expected
                    );
                    if resolved.source.has_lob_columns() {
                        message.push_str(&format!(
                            "; the row holds large objects, raw data: {}",
                            record.row_data.as_deref().unwrap_or("")
                        ));
                    }
                    return Err(Error::ProtocolViolation(message));
                }
            }
            _ => {}
        }

        self.source_table = Some(Arc::clone(&resolved.source));
        self.target_table = Some(Arc::clone(&resolved.target));
        Ok(Pull::Record(record))
    }

    /// Make `self.last` describe the record's table. Returns false when
    /// the record has to be skipped.
    fn resolve_tables(&mut self, record: &ChangeRecord) -> Result<bool> {
        let router_id = record.router_id.clone().unwrap_or_default();
        if let Some(last) = &self.last {
            if last.trigger_hist_id == record.trigger_hist_id && last.router_id == router_id {
                return Ok(true);
            }
        }

        let history = self
            .ctx
            .config
            .get_trigger_history(record.trigger_hist_id)
            .ok_or_else(|| {
                Error::Schema(format!(
                    "Could not locate trigger history {} for change {} of {}",
                    record.trigger_hist_id, record.data_id, record.table_name
                ))
            })?;

        let Some(router) = self.lookup_router(&router_id, record.trigger_hist_id) else {
            *self.missing_routers.entry(record.trigger_hist_id).or_insert(0) += 1;
            return Ok(false);
        };

        let reconciler = &self.ctx.reconciler;
        let source = reconciler.resolve(&router_id, &history, ResolveFlags::live().with_backfill())?;
        let target = reconciler.resolve(&router_id, &history, ResolveFlags::history().with_target_name())?;

        self.last = Some(Resolved {
            trigger_hist_id: record.trigger_hist_id,
            router_id,
            history,
            router,
            source,
            target,
        });
        Ok(true)
    }

    /// Router lookup. The configuration is re-read once per trigger history
    /// the first time a router is missing; after that the record is skipped.
    fn lookup_router(&self, router_id: &str, trigger_hist_id: i64) -> Option<RouterConfig> {
        let config = &self.ctx.config;
        if let Some(router) = config.get_router(router_id, false) {
            return Some(router);
        }
        if self.missing_routers.contains_key(&trigger_hist_id) {
            return None;
        }
        tracing::debug!(
            "Router '{}' for trigger history {} not cached, refreshing",
            router_id,
            trigger_hist_id
        );
        config.get_router(router_id, true)
    }

    /// Where clause of a reload: given literally, built from the captured
    /// primary key, or absent for the whole table
    fn reload_predicate(&self, record: &ChangeRecord, history: &TriggerHistory) -> Result<Option<String>> {
        if let Some(select) = record.row_data.as_deref().filter(|s| !s.trim().is_empty()) {
            return Ok(Some(select.to_string()));
        }
        if is_blank(record.pk_data.as_deref()) {
            return Ok(None);
        }
        let values = record.parsed_pk_data()?;
        let quote = self.ctx.reconciler.settings().dialect.quote;
        Ok(Some(primary_key_predicate(&history.pk_column_names, &values, quote)))
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}
