//! Row Sources
//!
//! Pull-based producers of change records. A [`RowSource`] is either a
//! [`TableSource`], selecting rows from live tables for a reload, or a
//! [`ChangeLogSource`], replaying captured changes for one batch. Both
//! hand out one record at a time; records that must be skipped never
//! reach the caller.

mod changelog;
mod cursor;
pub mod sql;
mod table;

pub use changelog::ChangeLogSource;
pub use table::{ReloadEvent, TableSource};

use std::sync::Arc;

use crate::error::Result;
use crate::model::{ChangeRecord, Table};
use crate::schema::SchemaReconciler;
use crate::store::{ConfigurationService, DataRouter};

/// Collaborators shared by the sources of one session
#[derive(Clone)]
pub struct SourceContext {
    pub reconciler: Arc<SchemaReconciler>,
    pub config: Arc<dyn ConfigurationService>,
    /// Routing decision applied to reloaded rows, if any
    pub data_router: Option<Arc<dyn DataRouter>>,
}

impl SourceContext {
    pub fn new(reconciler: Arc<SchemaReconciler>, config: Arc<dyn ConfigurationService>) -> Self {
        Self {
            reconciler,
            config,
            data_router: None,
        }
    }

    pub fn with_data_router(mut self, router: Arc<dyn DataRouter>) -> Self {
        self.data_router = Some(router);
        self
    }
}

/// Outcome of one internal pull
pub(crate) enum Pull {
    Record(ChangeRecord),
    /// Nothing to hand out for this input; pull again
    Skip,
    End,
}

/// A source of change records
pub enum RowSource {
    Table(TableSource),
    ChangeLog(ChangeLogSource),
}

impl RowSource {
    /// Next record, or `None` once the source is exhausted
    pub fn next(&mut self) -> Result<Option<ChangeRecord>> {
        match self {
            RowSource::Table(source) => source.next(),
            RowSource::ChangeLog(source) => source.next(),
        }
    }

    /// Source-side shape of the table the last record belongs to
    pub fn source_table(&self) -> Option<Arc<Table>> {
        match self {
            RowSource::Table(source) => source.source_table(),
            RowSource::ChangeLog(source) => source.source_table(),
        }
    }

    /// Target-side shape of the table the last record belongs to
    pub fn target_table(&self) -> Option<Arc<Table>> {
        match self {
            RowSource::Table(source) => source.target_table(),
            RowSource::ChangeLog(source) => source.target_table(),
        }
    }

    /// Release the source and report anything it skipped
    pub fn close(&mut self) {
        match self {
            RowSource::Table(source) => source.close(),
            RowSource::ChangeLog(source) => source.close(),
        }
    }
}

impl From<TableSource> for RowSource {
    fn from(source: TableSource) -> Self {
        RowSource::Table(source)
    }
}

impl From<ChangeLogSource> for RowSource {
    fn from(source: ChangeLogSource) -> Self {
        RowSource::ChangeLog(source)
    }
}
