//! SQLite Batch Store
//!
//! Persistent batch metadata backed by SQLite.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

use super::BatchStore;
use crate::error::{Error, Result};
use crate::model::{BatchStatus, BatchType, OutgoingBatch};

/// Batch metadata persisted in SQLite
pub struct SqliteBatchStore {
    conn: Mutex<Connection>,
}

impl SqliteBatchStore {
    /// Create or open the batch database in `data_dir`
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join("batches.db"))?;
        Self::init(conn)
    }

    /// Batch database that lives only as long as this store
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS outgoing_batch (
                batch_id INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                status TEXT NOT NULL,
                batch_type TEXT NOT NULL,
                load_id INTEGER,
                create_time TEXT NOT NULL,
                extract_start_time TEXT,
                data_row_count INTEGER NOT NULL DEFAULT 0,
                data_insert_row_count INTEGER NOT NULL DEFAULT 0,
                data_update_row_count INTEGER NOT NULL DEFAULT 0,
                data_delete_row_count INTEGER NOT NULL DEFAULT 0,
                other_row_count INTEGER NOT NULL DEFAULT 0,
                byte_count INTEGER NOT NULL DEFAULT 0,
                extract_millis INTEGER NOT NULL DEFAULT 0,
                last_update_time TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (batch_id, node_id)
            );

            CREATE INDEX IF NOT EXISTS idx_outgoing_batch_status
                ON outgoing_batch(node_id, status);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("Bad timestamp '{}': {}", value, e)))
}

impl BatchStore for SqliteBatchStore {
    fn find_batch(&self, batch_id: i64, node_id: &str) -> Result<Option<OutgoingBatch>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"
                SELECT channel_id, status, batch_type, load_id, create_time, extract_start_time,
                       data_row_count, data_insert_row_count, data_update_row_count,
                       data_delete_row_count, other_row_count, byte_count, extract_millis
                FROM outgoing_batch WHERE batch_id = ?1 AND node_id = ?2
                "#,
                params![batch_id, node_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        [
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                            row.get::<_, i64>(10)?,
                            row.get::<_, i64>(11)?,
                            row.get::<_, i64>(12)?,
                        ],
                    ))
                },
            )
            .optional()?;

        let Some((channel_id, status, batch_type, load_id, create_time, extract_start, counts)) = row
        else {
            return Ok(None);
        };

        Ok(Some(OutgoingBatch {
            batch_id,
            node_id: node_id.to_string(),
            channel_id,
            status: BatchStatus::from_code(&status),
            batch_type: BatchType::parse(&batch_type),
            load_id,
            create_time: parse_time(&create_time)?,
            extract_start_time: extract_start.as_deref().map(parse_time).transpose()?,
            data_row_count: counts[0] as u64,
            data_insert_row_count: counts[1] as u64,
            data_update_row_count: counts[2] as u64,
            data_delete_row_count: counts[3] as u64,
            other_row_count: counts[4] as u64,
            byte_count: counts[5] as u64,
            extract_millis: counts[6] as u64,
        }))
    }

    fn update_batch(&self, batch: &OutgoingBatch) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE outgoing_batch SET
                status = ?3, extract_start_time = ?4, data_row_count = ?5,
                data_insert_row_count = ?6, data_update_row_count = ?7,
                data_delete_row_count = ?8, other_row_count = ?9, byte_count = ?10,
                extract_millis = ?11, last_update_time = CURRENT_TIMESTAMP
            WHERE batch_id = ?1 AND node_id = ?2
            "#,
            params![
                batch.batch_id,
                batch.node_id,
                batch.status.code(),
                batch.extract_start_time.map(|t| t.to_rfc3339()),
                batch.data_row_count as i64,
                batch.data_insert_row_count as i64,
                batch.data_update_row_count as i64,
                batch.data_delete_row_count as i64,
                batch.other_row_count as i64,
                batch.byte_count as i64,
                batch.extract_millis as i64,
            ],
        )?;

        if updated == 0 {
            return Err(Error::BatchNotFound {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
            });
        }
        Ok(())
    }

    fn insert_batch(&self, batch: &OutgoingBatch) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO outgoing_batch (batch_id, node_id, channel_id, status, batch_type,
                load_id, create_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                batch.batch_id,
                batch.node_id,
                batch.channel_id,
                batch.status.code(),
                batch.batch_type.as_str(),
                batch.load_id,
                batch.create_time.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
