//! Table Source
//!
//! Selects rows straight from live tables for a reload. Each queued
//! [`ReloadEvent`] names one table; its rows are pulled through a cursor
//! that may be reopened several times:
//!
//! - once per level of a self-referencing foreign key, roots first, so a
//!   target replaying the inserts in order never sees a child before its
//!   parent;
//! - once more for the large-object columns when the dialect needs them
//!   selected separately. The second pass emits updates keyed by primary
//!   key in the same order as the first.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use super::cursor::PagedCursor;
use super::sql::self_reference_predicate;
use super::{Pull, SourceContext};
use crate::error::Result;
use crate::model::{csv, ChangeRecord, DataEventType, RouterConfig, SelfReference, Table, TriggerHistory};
use crate::platform::{Row, RowCursor};
use crate::schema::ResolveFlags;
use crate::store::RoutingContext;

/// One table to reload
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    pub history: TriggerHistory,
    pub router: RouterConfig,
    /// Extra predicate restricting the selected rows
    pub initial_load_select: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LobPass {
    /// All columns in one select
    Single,
    /// Everything except large objects
    Rows,
    /// Primary key and large objects
    Lobs,
}

struct ActiveTable {
    event: ReloadEvent,
    source: Arc<Table>,
    target: Arc<Table>,
    pass: LobPass,
    pass_source: Arc<Table>,
    pass_target: Arc<Table>,
    self_ref: Option<SelfReference>,
    level: u32,
    level_rows: u64,
    rows: u64,
    cursor: RowCursor,
    /// Keys the router turned away in the first of two passes
    excluded_keys: HashSet<String>,
}

impl ActiveTable {
    fn set_pass(&mut self, pass: LobPass) {
        self.pass = pass;
        self.level = 0;
        self.level_rows = 0;
        self.pass_source = pass_table(&self.source, pass);
        self.pass_target = pass_table(&self.target, pass);
    }

    /// Encoded primary key values of a row selected in the current pass
    fn key_of(&self, row: &Row) -> String {
        let values: Vec<Option<String>> = self
            .pass_source
            .columns
            .iter()
            .zip(row)
            .filter(|(column, _)| column.primary_key)
            .map(|(_, value)| value.clone())
            .collect();
        csv::encode(&values)
    }
}

/// Table restricted to the columns selected in a pass
fn pass_table(table: &Arc<Table>, pass: LobPass) -> Arc<Table> {
    let keep: Vec<String> = match pass {
        LobPass::Single => return Arc::clone(table),
        LobPass::Rows => table
            .columns
            .iter()
            .filter(|c| !c.column_type.is_lob())
            .map(|c| c.name.clone())
            .collect(),
        LobPass::Lobs => table
            .columns
            .iter()
            .filter(|c| c.primary_key || c.column_type.is_lob())
            .map(|c| c.name.clone())
            .collect(),
    };
    Arc::new(table.copy_and_filter_columns(&keep, &[], false, false))
}

/// Row source over live tables
pub struct TableSource {
    ctx: SourceContext,
    channel_id: String,
    events: VecDeque<ReloadEvent>,
    active: Option<ActiveTable>,
    source_table: Option<Arc<Table>>,
    target_table: Option<Arc<Table>>,
    oversized: u64,
}

impl TableSource {
    pub fn new(ctx: SourceContext, channel_id: impl Into<String>, events: Vec<ReloadEvent>) -> Self {
        Self {
            ctx,
            channel_id: channel_id.into(),
            events: events.into(),
            active: None,
            source_table: None,
            target_table: None,
            oversized: 0,
        }
    }

    /// Next selected row
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

    /// Rows replaced by a placeholder because they were too large
    pub fn oversized_rows(&self) -> u64 {
        self.oversized
    }

    pub fn close(&mut self) {
        self.active = None;
        self.events.clear();
        if self.oversized > 0 {
            tracing::warn!(
                "{} rows on channel {} exceeded the row size limit and were not extracted",
                self.oversized,
                self.channel_id
            );
        }
    }

    pub(crate) fn pull(&mut self) -> Result<Pull> {
        if self.active.is_none() {
            return match self.events.pop_front() {
                Some(event) => {
                    let active = self.start(event)?;
                    self.active = Some(active);
                    Ok(Pull::Skip)
                }
                None => Ok(Pull::End),
            };
        }

        let fetched = match self.active.as_mut() {
            Some(active) => active.cursor.next(),
            None => return Ok(Pull::End),
        };
        match fetched {
            Some(row) => self.emit(row?),
            None => {
                self.advance()?;
                Ok(Pull::Skip)
            }
        }
    }

    fn start(&self, event: ReloadEvent) -> Result<ActiveTable> {
        let reconciler = &self.ctx.reconciler;
        let settings = reconciler.settings();
        let router_id = event.router.router_id.as_str();

        let source = reconciler.resolve(router_id, &event.history, ResolveFlags::live())?;
        let target = reconciler.lookup_table_expanded(
            router_id,
            &event.history,
            ResolveFlags::live().with_target_name(),
        )?;

        let pass = if settings.dialect.two_pass_lob && source.has_lob_columns() {
            LobPass::Rows
        } else {
            LobPass::Single
        };
        let self_ref = if settings.self_ref_ordering {
            source.self_reference()
        } else {
            None
        };

        tracing::info!(
            "Extracting {} for node {}{}{}",
            source.qualified_name(),
            reconciler.target_node().node_id,
            if self_ref.is_some() { " by parent level" } else { "" },
            if pass == LobPass::Rows { " in two passes" } else { "" },
        );

        let mut active = ActiveTable {
            pass_source: pass_table(&source, pass),
            pass_target: pass_table(&target, pass),
            event,
            source,
            target,
            pass,
            self_ref,
            level: 0,
            level_rows: 0,
            rows: 0,
            cursor: Box::new(std::iter::empty()),
            excluded_keys: HashSet::new(),
        };
        active.cursor = open_cursor(&self.ctx, &active)?;
        Ok(active)
    }

    /// Current cursor is exhausted: open the next level or pass, or finish
    fn advance(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        if active.self_ref.is_some() && active.level_rows > 0 {
            active.level += 1;
            active.level_rows = 0;
            tracing::debug!(
                "Selecting level {} of {}",
                active.level,
                active.source.qualified_name()
            );
            active.cursor = open_cursor(&self.ctx, active)?;
            return Ok(());
        }

        if active.pass == LobPass::Rows {
            active.set_pass(LobPass::Lobs);
            active.cursor = open_cursor(&self.ctx, active)?;
            return Ok(());
        }

        tracing::info!(
            "Extracted {} rows from {}",
            active.rows,
            active.source.qualified_name()
        );
        self.active = None;
        Ok(())
    }

    fn emit(&mut self, row: Row) -> Result<Pull> {
        let Some(active) = self.active.as_mut() else {
            return Ok(Pull::End);
        };
        active.level_rows += 1;

        let settings = self.ctx.reconciler.settings();
        let hist = &active.event.history;
        let key = active.key_of(&row);

        let mut record = ChangeRecord::new(
            DataEventType::Insert,
            hist.source_table_name.clone(),
            hist.trigger_hist_id,
            self.channel_id.clone(),
            Some(csv::encode(&row)),
        )
        .with_router(active.event.router.router_id.clone());
        if active.pass == LobPass::Lobs {
            record.event_type = DataEventType::Update;
            record.pk_data = Some(key.clone());
            record.contains_big_lob = true;
        }

        if !is_routed(&self.ctx, &self.channel_id, active, &record, &key)? {
            return Ok(Pull::Skip);
        }

        self.source_table = Some(Arc::clone(&active.pass_source));
        self.target_table = Some(Arc::clone(&active.pass_target));
        active.rows += 1;

        if let Some(max) = settings.max_row_size_bytes {
            let chars: u64 = row.iter().flatten().map(|v| v.chars().count() as u64).sum();
            let estimated = chars.saturating_mul(settings.row_size_factor);
            if estimated > max {
                tracing::warn!(
                    "Row of {} with primary key {} is about {} bytes, over the {} byte limit; sending a placeholder",
                    active.source.qualified_name(),
                    key,
                    estimated,
                    max
                );
                self.oversized += 1;
                let hist = &active.event.history;
                let sentinel = ChangeRecord::oversized_row_sentinel(
                    hist.source_table_name.clone(),
                    hist.trigger_hist_id,
                    self.channel_id.clone(),
                )
                .with_router(active.event.router.router_id.clone());
                return Ok(Pull::Record(sentinel));
            }
        }

        Ok(Pull::Record(record))
    }
}

fn open_cursor(ctx: &SourceContext, active: &ActiveTable) -> Result<RowCursor> {
    let reconciler = &ctx.reconciler;
    let quote = reconciler.settings().dialect.quote;

    let mut predicates = Vec::new();
    if let Some(select) = &active.event.initial_load_select {
        predicates.push(select.clone());
    }
    if let Some(reference) = &active.self_ref {
        predicates.push(self_reference_predicate(
            &active.source,
            reference,
            active.level,
            quote,
        ));
    }

    let cursor = PagedCursor::open(
        Arc::clone(reconciler.platform_for(&active.event.history.source_table_name)),
        Arc::clone(&active.pass_source),
        predicates,
        quote,
        reconciler.settings().query_page_rows,
    )?;
    Ok(Box::new(cursor))
}

/// Ask the data router whether a reloaded row belongs to the target node
fn is_routed(
    ctx: &SourceContext,
    channel_id: &str,
    active: &mut ActiveTable,
    record: &ChangeRecord,
    key: &str,
) -> Result<bool> {
    let settings = ctx.reconciler.settings();
    let Some(data_router) = ctx.data_router.as_ref() else {
        return Ok(true);
    };
    if !settings.route_reload_rows || active.event.router.is_default() {
        return Ok(true);
    }
    if active.pass == LobPass::Lobs {
        return Ok(!active.excluded_keys.contains(key));
    }

    let target = ctx.reconciler.target_node();
    let routing = RoutingContext {
        source_node_id: &settings.node_id,
        channel_id,
        router: &active.event.router,
    };
    let nodes = data_router.route_to_nodes(
        &routing,
        record,
        &active.pass_source,
        std::slice::from_ref(target),
    )?;

    let routed = nodes.contains(&target.node_id);
    if !routed && active.pass == LobPass::Rows {
        active.excluded_keys.insert(key.to_string());
    }
    Ok(routed)
}
