//! Database Platform Module
//!
//! The relational metadata and query surface the extraction pipeline
//! consumes: table descriptions, row cursors, and the dialect capability
//! flags that change how rows are selected.

mod sqlite;

pub use sqlite::SqlitePlatform;

use crate::error::Result;
use crate::model::Table;

/// One fetched row, fields in select order, binary values base64 encoded
pub type Row = Vec<Option<String>>;

/// Forward-only cursor over query results
pub type RowCursor = Box<dyn Iterator<Item = Result<Row>> + Send>;

/// Dialect capability flags, plain data handed to each session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectInfo {
    /// Large objects must be selected in a separate pass from other columns
    pub two_pass_lob: bool,
    /// Identifier quote character
    pub quote: char,
}

impl Default for DialectInfo {
    fn default() -> Self {
        Self {
            two_pass_lob: false,
            quote: '"',
        }
    }
}

/// A database the pipeline reads table shapes and rows from
pub trait Platform: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Capability flags of this database
    fn dialect(&self) -> DialectInfo;

    /// Describe a live table. `force_refresh` bypasses any cached
    /// description. Returns `None` when the table does not exist.
    fn describe_table(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        force_refresh: bool,
    ) -> Result<Option<Table>>;

    /// Run a select and return its rows. Failing to open the cursor is
    /// reported as `Error::Cursor`. Implementations may read the whole
    /// result up front; table reads bound it with `LIMIT` pages.
    fn query(&self, sql: &str) -> Result<RowCursor>;
}
