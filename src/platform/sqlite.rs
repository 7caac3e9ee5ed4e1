//! SQLite Platform
//!
//! Embedded platform backed by rusqlite. Table descriptions come from the
//! `PRAGMA` interface and are cached until a forced refresh.

use base64::Engine;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;

use super::{DialectInfo, Platform, Row, RowCursor};
use crate::error::{Error, Result};
use crate::model::{quote_identifier, Column, ColumnType, ForeignKey, Index, Reference, Table};

/// Platform over a single SQLite connection
pub struct SqlitePlatform {
    conn: Mutex<Connection>,
    dialect: DialectInfo,
    /// Cached table descriptions keyed by lower-cased qualified name
    tables: Mutex<HashMap<String, Table>>,
}

impl SqlitePlatform {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            dialect: DialectInfo::default(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Override the dialect flags (e.g. to force two-pass LOB extraction)
    pub fn with_dialect(mut self, dialect: DialectInfo) -> Self {
        self.dialect = dialect;
        self
    }

    /// Run one or more statements, used for setup and test fixtures
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn cache_key(schema: Option<&str>, name: &str) -> String {
        match schema {
            Some(schema) => format!("{}.{}", schema, name).to_lowercase(),
            None => name.to_lowercase(),
        }
    }

    fn pragma(schema: Option<&str>, pragma: &str, arg: &str) -> String {
        let arg = quote_identifier(arg, '"');
        match schema {
            Some(schema) => format!("PRAGMA {}.{}({})", quote_identifier(schema, '"'), pragma, arg),
            None => format!("PRAGMA {}({})", pragma, arg),
        }
    }

    fn read_table(conn: &Connection, schema: Option<&str>, name: &str) -> Result<Option<Table>> {
        let mut stmt = conn.prepare(&Self::pragma(schema, "table_info", name))?;
        let columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let type_name: String = row.get(2)?;
                let not_null: i64 = row.get(3)?;
                let default_value: Option<String> = row.get(4)?;
                let pk: i64 = row.get(5)?;
                Ok(Column {
                    column_type: ColumnType::from_declared(&type_name),
                    name,
                    type_name,
                    primary_key: pk > 0,
                    required: not_null != 0 || pk > 0,
                    default_value,
                    auto_increment: false,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Ok(None);
        }

        let mut table = Table::new(name).with_columns(columns);
        table.schema = schema.map(|s| s.to_string());
        table.foreign_keys = Self::read_foreign_keys(conn, schema, name)?;
        table.indices = Self::read_indices(conn, schema, name)?;
        Ok(Some(table))
    }

    fn read_foreign_keys(
        conn: &Connection,
        schema: Option<&str>,
        name: &str,
    ) -> Result<Vec<ForeignKey>> {
        let mut stmt = conn.prepare(&Self::pragma(schema, "foreign_key_list", name))?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let seq: i64 = row.get(1)?;
                let foreign_table: String = row.get(2)?;
                let local_column: String = row.get(3)?;
                let foreign_column: Option<String> = row.get(4)?;
                Ok((id, seq, foreign_table, local_column, foreign_column))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
        for (id, seq, foreign_table, local_column, foreign_column) in rows {
            let foreign_column = match foreign_column {
                Some(column) => column,
                // No target column names the foreign table's primary key
                None => Self::read_primary_key(conn, schema, &foreign_table)?
                    .into_iter()
                    .nth(seq as usize)
                    .ok_or_else(|| {
                        Error::Schema(format!(
                            "Foreign key {} of {} references {} which has no primary key column {}",
                            id, name, foreign_table, seq
                        ))
                    })?,
            };
            let reference = Reference {
                local_column,
                foreign_column,
            };
            match keys.iter_mut().find(|(key_id, _)| *key_id == id) {
                Some((_, fk)) => fk.references.push(reference),
                None => keys.push((
                    id,
                    ForeignKey {
                        name: format!("fk_{}_{}", name, id),
                        foreign_table,
                        references: vec![reference],
                    },
                )),
            }
        }

        Ok(keys.into_iter().map(|(_, fk)| fk).collect())
    }

    /// Primary key column names in key order
    fn read_primary_key(conn: &Connection, schema: Option<&str>, name: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&Self::pragma(schema, "table_info", name))?;
        let mut columns = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        columns.retain(|(pk, _)| *pk > 0);
        columns.sort_by_key(|(pk, _)| *pk);
        Ok(columns.into_iter().map(|(_, column)| column).collect())
    }

    fn read_indices(conn: &Connection, schema: Option<&str>, name: &str) -> Result<Vec<Index>> {
        let mut stmt = conn.prepare(&Self::pragma(schema, "index_list", name))?;
        let listed = stmt
            .query_map([], |row| {
                let index_name: String = row.get(1)?;
                let unique: i64 = row.get(2)?;
                let origin: String = row.get(3)?;
                Ok((index_name, unique != 0, origin))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut indices = Vec::new();
        for (index_name, unique, origin) in listed {
            // Primary key indexes are implied by the columns
            if origin == "pk" {
                continue;
            }
            let mut info = conn.prepare(&Self::pragma(schema, "index_info", &index_name))?;
            let columns = info
                .query_map([], |row| row.get::<_, Option<String>>(2))?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .collect();
            indices.push(Index {
                name: index_name,
                unique,
                columns,
            });
        }

        Ok(indices)
    }
}

impl Platform for SqlitePlatform {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn dialect(&self) -> DialectInfo {
        self.dialect
    }

    fn describe_table(
        &self,
        _catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        force_refresh: bool,
    ) -> Result<Option<Table>> {
        let key = Self::cache_key(schema, name);
        if !force_refresh {
            if let Some(table) = self.tables.lock().get(&key) {
                return Ok(Some(table.clone()));
            }
        }

        tracing::debug!("Reading table definition for {} (refresh={})", key, force_refresh);
        let table = {
            let conn = self.conn.lock();
            Self::read_table(&conn, schema, name)?
        };

        let mut cache = self.tables.lock();
        match &table {
            Some(table) => {
                cache.insert(key, table.clone());
            }
            None => {
                cache.remove(&key);
            }
        }
        Ok(table)
    }

    fn query(&self, sql: &str) -> Result<RowCursor> {
        tracing::debug!("Query: {}", sql);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Cursor(format!("{} [{}]", e, sql)))?;
        let width = stmt.column_count();

        let mut rows: Vec<Result<Row>> = Vec::new();
        let mut cursor = stmt
            .query([])
            .map_err(|e| Error::Cursor(format!("{} [{}]", e, sql)))?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(value_to_string(row.get_ref(i)?).map_err(|e| {
                    Error::Database(format!("Column {} of [{}] is not valid UTF-8 text: {}", i, sql, e))
                })?);
            }
            rows.push(Ok(values));
        }

        Ok(Box::new(rows.into_iter()))
    }
}

fn value_to_string(value: ValueRef<'_>) -> std::result::Result<Option<String>, std::str::Utf8Error> {
    Ok(match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(std::str::from_utf8(t)?.to_string()),
        ValueRef::Blob(b) => Some(base64::engine::general_purpose::STANDARD.encode(b)),
    })
}
