//! Paged Table Cursor
//!
//! Reads a table in primary key order one page at a time, so a platform
//! never holds more than one page of rows and its connection is free
//! between pages.

use std::sync::Arc;

use super::sql::{keyset_predicate, select_sql};
use crate::error::{Error, Result};
use crate::model::{ColumnType, Table};
use crate::platform::{Platform, Row, RowCursor};

/// Cursor that re-queries after each full page, continuing past the last
/// primary key it handed out
pub(crate) struct PagedCursor {
    platform: Arc<dyn Platform>,
    table: Arc<Table>,
    predicates: Vec<String>,
    quote: char,
    page_rows: usize,
    /// Positions of the primary key columns in a selected row
    key_positions: Vec<usize>,
    key_names: Vec<String>,
    page: RowCursor,
    fetched_in_page: usize,
    last_key: Option<Vec<Option<String>>>,
    exhausted: bool,
}

impl PagedCursor {
    /// Open the first page. Tables whose keys cannot be compared as text
    /// are read with a single query.
    pub(crate) fn open(
        platform: Arc<dyn Platform>,
        table: Arc<Table>,
        predicates: Vec<String>,
        quote: char,
        page_rows: usize,
    ) -> Result<Self> {
        let keys: Vec<(usize, String)> = table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, c)| (i, c.name.clone()))
            .collect();
        let pageable = !keys.is_empty()
            && table
                .columns
                .iter()
                .filter(|c| c.primary_key)
                .all(|c| key_comparable(c.column_type));

        let mut cursor = Self {
            platform,
            table,
            predicates,
            quote,
            page_rows: if pageable { page_rows } else { 0 },
            key_positions: keys.iter().map(|(i, _)| *i).collect(),
            key_names: keys.into_iter().map(|(_, name)| name).collect(),
            page: Box::new(std::iter::empty()),
            fetched_in_page: 0,
            last_key: None,
            exhausted: false,
        };
        cursor.page = cursor.query_page()?;
        Ok(cursor)
    }

    fn query_page(&self) -> Result<RowCursor> {
        let mut predicates = self.predicates.clone();
        if let Some(last) = &self.last_key {
            predicates.push(keyset_predicate(&self.key_names, last, self.quote));
        }
        let columns: Vec<_> = self.table.columns.iter().collect();
        let mut sql = select_sql(&self.table, &columns, &predicates, self.quote);
        if self.page_rows > 0 {
            sql.push_str(&format!(" LIMIT {}", self.page_rows));
        }
        self.platform.query(&sql)
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if self.exhausted {
                return Ok(None);
            }
            match self.page.next() {
                Some(row) => {
                    let row = row?;
                    self.fetched_in_page += 1;
                    if self.page_rows > 0 {
                        let key = self
                            .key_positions
                            .iter()
                            .map(|&i| row.get(i).cloned().flatten())
                            .collect();
                        self.last_key = Some(key);
                    }
                    return Ok(Some(row));
                }
                None if self.page_rows > 0 && self.fetched_in_page >= self.page_rows => {
                    tracing::trace!(
                        "Page of {} rows from {} done; fetching the next",
                        self.fetched_in_page,
                        self.table.qualified_name()
                    );
                    self.fetched_in_page = 0;
                    self.page = self.query_page().map_err(|e| match e {
                        Error::Cursor(message) => Error::Database(message),
                        other => other,
                    })?;
                }
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }
    }
}

impl Iterator for PagedCursor {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_row() {
            Ok(row) => row.map(Ok),
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

/// Key types whose text form orders the same way the database orders them
fn key_comparable(column_type: ColumnType) -> bool {
    !matches!(
        column_type,
        ColumnType::Blob | ColumnType::Clob | ColumnType::Boolean | ColumnType::Other
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Column;
    use crate::platform::{DialectInfo, SqlitePlatform};
    use parking_lot::Mutex;

    /// Platform that remembers every select it ran
    struct RecordingPlatform {
        inner: SqlitePlatform,
        queries: Mutex<Vec<String>>,
    }

    impl Platform for RecordingPlatform {
        fn name(&self) -> &str {
            "recording"
        }

        fn dialect(&self) -> DialectInfo {
            self.inner.dialect()
        }

        fn describe_table(
            &self,
            catalog: Option<&str>,
            schema: Option<&str>,
            name: &str,
            force_refresh: bool,
        ) -> Result<Option<Table>> {
            self.inner.describe_table(catalog, schema, name, force_refresh)
        }

        fn query(&self, sql: &str) -> Result<RowCursor> {
            self.queries.lock().push(sql.to_string());
            self.inner.query(sql)
        }
    }

    fn recording(sql: &str) -> Arc<RecordingPlatform> {
        let inner = SqlitePlatform::open_in_memory().unwrap();
        inner.execute_batch(sql).unwrap();
        Arc::new(RecordingPlatform {
            inner,
            queries: Mutex::new(Vec::new()),
        })
    }

    fn numbers(rows: u32) -> String {
        format!(
            r#"
            CREATE TABLE item (id INTEGER PRIMARY KEY, label TEXT);
            WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < {rows})
            INSERT INTO item SELECT i, 'item' || i FROM n;
            "#
        )
    }

    fn item() -> Arc<Table> {
        Arc::new(Table::new("item").with_columns(vec![
            Column::typed("id", "INTEGER").primary(),
            Column::typed("label", "TEXT"),
        ]))
    }

    fn ids(cursor: PagedCursor) -> Vec<String> {
        cursor
            .map(|row| row.unwrap()[0].clone().unwrap())
            .collect()
    }

    #[test]
    fn test_reads_every_page_in_key_order() {
        let platform = recording(&numbers(25));
        let cursor = PagedCursor::open(platform.clone(), item(), Vec::new(), '"', 10).unwrap();

        let expected: Vec<String> = (1..=25).map(|i| i.to_string()).collect();
        assert_eq!(ids(cursor), expected);

        let queries = platform.queries.lock();
        assert_eq!(queries.len(), 3);
        assert!(queries[0].ends_with("LIMIT 10"));
        assert!(queries[2].contains(r#"("id" > '20')"#));
    }

    #[test]
    fn test_full_last_page_ends_on_empty_page() {
        let platform = recording(&numbers(20));
        let cursor = PagedCursor::open(platform.clone(), item(), Vec::new(), '"', 10).unwrap();
        assert_eq!(ids(cursor).len(), 20);
        assert_eq!(platform.queries.lock().len(), 3);
    }

    #[test]
    fn test_filters_apply_to_every_page() {
        let platform = recording(&numbers(30));
        let cursor = PagedCursor::open(
            platform.clone(),
            item(),
            vec!["id % 3 = 0".to_string()],
            '"',
            4,
        )
        .unwrap();
        assert_eq!(
            ids(cursor),
            vec!["3", "6", "9", "12", "15", "18", "21", "24", "27", "30"]
        );
        assert!(platform.queries.lock().iter().all(|q| q.contains("(id % 3 = 0)")));
    }

    #[test]
    fn test_composite_text_key() {
        let platform = recording(
            r#"
            CREATE TABLE stock (shop VARCHAR(10), sku VARCHAR(10), qty INTEGER, PRIMARY KEY (shop, sku));
            INSERT INTO stock VALUES ('b', 'x', 1), ('a', 'z', 2), ('a', 'y', 3), ('b', 'w', 4), ('c''s', 'v', 5);
            "#,
        );
        let table = Arc::new(Table::new("stock").with_columns(vec![
            Column::typed("shop", "VARCHAR(10)").primary(),
            Column::typed("sku", "VARCHAR(10)").primary(),
            Column::typed("qty", "INTEGER"),
        ]));
        let rows: Vec<String> = PagedCursor::open(platform, table, Vec::new(), '"', 2)
            .unwrap()
            .map(|row| row.unwrap()[2].clone().unwrap())
            .collect();
        assert_eq!(rows, vec!["3", "2", "4", "1", "5"]);
    }

    #[test]
    fn test_table_without_key_is_read_in_one_query() {
        let platform = recording(&numbers(15));
        let table = Arc::new(Table::new("item").with_columns(vec![
            Column::typed("id", "INTEGER"),
            Column::typed("label", "TEXT"),
        ]));
        let cursor = PagedCursor::open(platform.clone(), table, Vec::new(), '"', 10).unwrap();
        assert_eq!(cursor.count(), 15);
        let queries = platform.queries.lock();
        assert_eq!(queries.len(), 1);
        assert!(!queries[0].contains("LIMIT"));
    }

    #[test]
    fn test_open_failure_is_a_cursor_error() {
        let platform = recording("CREATE TABLE unrelated (id INTEGER)");
        match PagedCursor::open(platform, item(), Vec::new(), '"', 10) {
            Err(Error::Cursor(_)) => {}
            Err(other) => panic!("expected a cursor error, got {:?}", other),
            Ok(_) => panic!("expected a cursor error"),
        }
    }
}
