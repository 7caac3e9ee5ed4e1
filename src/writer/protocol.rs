//! Batch Payload Encoding
//!
//! One line per item. A batch opens with its header and `batch,<id>`,
//! re-emits a table block whenever the target table changes, carries one
//! line per row event and closes with `commit,<id>`. Only the `batch` and
//! `commit` lines hold the batch id.

use std::io::Write;

use crate::error::{Error, Result};
use crate::model::{csv, ChangeRecord, DataEventType, OutgoingBatch, Table};

pub const BATCH_TOKEN: &str = "batch";
pub const COMMIT_TOKEN: &str = "commit";

/// Writes batches in the line protocol
pub struct ProtocolWriter<W: Write> {
    out: W,
    source_node_id: String,
    /// Table block last written in the current batch
    last_table: Option<String>,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(out: W, source_node_id: impl Into<String>) -> Self {
        Self {
            out,
            source_node_id: source_node_id.into(),
            last_table: None,
        }
    }

    pub fn start_batch(&mut self, batch: &OutgoingBatch) -> Result<()> {
        self.last_table = None;
        writeln!(self.out, "nodeid,{}", self.source_node_id)?;
        writeln!(self.out, "binary,BASE64")?;
        writeln!(self.out, "channel,{}", batch.channel_id)?;
        writeln!(self.out, "{},{}", BATCH_TOKEN, batch.batch_id)?;
        Ok(())
    }

    /// Write one record under its target table
    pub fn write(&mut self, record: &ChangeRecord, table: &Table) -> Result<()> {
        self.write_table(table)?;

        let row = record.row_data.as_deref().unwrap_or("");
        match record.event_type {
            DataEventType::Insert => writeln!(self.out, "insert,{}", row)?,
            DataEventType::Update => {
                if let Some(old) = &record.old_data {
                    writeln!(self.out, "old,{}", old)?;
                }
                writeln!(
                    self.out,
                    "update,{},{}",
                    row,
                    record.pk_data.as_deref().unwrap_or("")
                )?;
            }
            DataEventType::Delete => {
                if let Some(old) = &record.old_data {
                    writeln!(self.out, "old,{}", old)?;
                }
                writeln!(self.out, "delete,{}", record.pk_data.as_deref().unwrap_or(""))?;
            }
            DataEventType::Sql => writeln!(self.out, "sql,{}", csv::encode(&[record.row_data.clone()]))?,
            DataEventType::Create => {
                writeln!(self.out, "create,{}", csv::encode(&[record.row_data.clone()]))?
            }
            DataEventType::Script => {
                writeln!(self.out, "bsh,{}", csv::encode(&[record.row_data.clone()]))?
            }
            DataEventType::Reload => {
                return Err(Error::ProtocolViolation(format!(
                    "Reload marker for {} reached the batch writer unexpanded",
                    record.table_name
                )))
            }
        }
        Ok(())
    }

    pub fn end_batch(&mut self, batch: &OutgoingBatch) -> Result<()> {
        writeln!(self.out, "{},{}", COMMIT_TOKEN, batch.batch_id)?;
        self.out.flush()?;
        Ok(())
    }

    fn write_table(&mut self, table: &Table) -> Result<()> {
        let columns = csv::encode_names(&table.column_names());
        let identity = format!("{}|{}", table.qualified_name(), columns);
        if self.last_table.as_deref() == Some(identity.as_str()) {
            return Ok(());
        }

        if let Some(catalog) = &table.catalog {
            writeln!(self.out, "catalog,{}", catalog)?;
        }
        if let Some(schema) = &table.schema {
            writeln!(self.out, "schema,{}", schema)?;
        }
        writeln!(self.out, "table,{}", table.name)?;
        writeln!(self.out, "keys,{}", csv::encode_names(&table.primary_key_names()))?;
        writeln!(self.out, "columns,{}", columns)?;
        self.last_table = Some(identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchType, Column};

    fn customer() -> Table {
        Table::new("customer").with_columns(vec![
            Column::typed("id", "INTEGER").primary(),
            Column::typed("name", "VARCHAR(20)"),
        ])
    }

    #[test]
    fn test_batch_layout() {
        let batch = OutgoingBatch::new(1001, "nodeB", "reload", BatchType::Reload);
        let mut out = Vec::new();
        {
            let mut writer = ProtocolWriter::new(&mut out, "corp-000");
            writer.start_batch(&batch).unwrap();
            let insert = ChangeRecord::new(DataEventType::Insert, "customer", 1, "reload", Some("\"1\",\"Alice\"".into()));
            writer.write(&insert, &customer()).unwrap();
            let update = ChangeRecord::new(DataEventType::Update, "customer", 1, "reload", Some("\"1\",\"Al\"".into()))
                .with_pk_data(Some("\"1\"".into()))
                .with_old_data(Some("\"1\",\"Alice\"".into()));
            writer.write(&update, &customer()).unwrap();
            let delete = ChangeRecord::new(DataEventType::Delete, "customer", 1, "reload", None)
                .with_pk_data(Some("\"1\"".into()));
            writer.write(&delete, &customer()).unwrap();
            writer.end_batch(&batch).unwrap();
        }

        let text = String::from_utf8(out).unwrap();
        let expected = [
            "nodeid,corp-000",
            "binary,BASE64",
            "channel,reload",
            "batch,1001",
            "table,customer",
            "keys,\"id\"",
            "columns,\"id\",\"name\"",
            "insert,\"1\",\"Alice\"",
            "old,\"1\",\"Alice\"",
            "update,\"1\",\"Al\",\"1\"",
            "delete,\"1\"",
            "commit,1001",
        ];
        assert_eq!(text.lines().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_table_block_repeated_on_change() {
        let batch = OutgoingBatch::new(1, "nodeB", "default", BatchType::Extract);
        let mut other = customer();
        other.name = "supplier".into();
        let record = ChangeRecord::new(DataEventType::Insert, "customer", 1, "default", Some("\"1\",\"x\"".into()));

        let mut out = Vec::new();
        {
            let mut writer = ProtocolWriter::new(&mut out, "corp-000");
            writer.start_batch(&batch).unwrap();
            writer.write(&record, &customer()).unwrap();
            writer.write(&record, &other).unwrap();
            writer.write(&record, &customer()).unwrap();
            writer.end_batch(&batch).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("table,").count(), 3);
        assert_eq!(text.matches("insert,").count(), 3);
    }

    #[test]
    fn test_oversized_sentinel_and_unexpanded_reload() {
        let batch = OutgoingBatch::new(1, "nodeB", "default", BatchType::Extract);
        let mut out = Vec::new();
        let mut writer = ProtocolWriter::new(&mut out, "corp-000");
        writer.start_batch(&batch).unwrap();
        writer
            .write(&ChangeRecord::oversized_row_sentinel("customer", 1, "default"), &customer())
            .unwrap();
        let reload = ChangeRecord::new(DataEventType::Reload, "customer", 1, "default", None);
        assert!(writer.write(&reload, &customer()).is_err());
        drop(writer);
        assert!(String::from_utf8(out).unwrap().ends_with("sql,\n"));
    }
}
