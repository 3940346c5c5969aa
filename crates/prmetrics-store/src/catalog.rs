use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prmetrics_core::CollectionBatch;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::{CATALOG_FILE_NAME, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Complete,
    /// Some partitions were deferred and still need a retry.
    Partial,
    Expired,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Expired => "expired",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "partial" => Self::Partial,
            "expired" => Self::Expired,
            _ => Self::Complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogBatch {
    pub batch_id: String,
    pub organization: String,
    pub window_days: u32,
    pub collected_at: DateTime<Utc>,
    pub record_count: u64,
    pub files_written: u64,
    pub status: BatchStatus,
}

/// SQLite bookkeeping of ingestion runs, kept next to the partition tree.
pub struct BatchCatalog {
    conn: Connection,
    path: PathBuf,
}

impl BatchCatalog {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(CATALOG_FILE_NAME);

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_batch(
        &self,
        batch: &CollectionBatch,
        status: BatchStatus,
        files_written: usize,
    ) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
            INSERT INTO batches (
                batch_id, organization, window_days, collected_at, record_count, files_written, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(batch_id) DO UPDATE SET
                record_count = excluded.record_count,
                files_written = batches.files_written + excluded.files_written,
                status = excluded.status
            "#,
            params![
                batch.batch_id,
                batch.organization,
                batch.window_days,
                batch.collected_at.timestamp_millis(),
                batch.identities.len() as i64,
                files_written as i64,
                status.as_str(),
            ],
        )?;
        {
            let mut insert = tx.prepare(
                r#"
                INSERT OR IGNORE INTO batch_identities (batch_id, repository, pr_number)
                VALUES (?1, ?2, ?3)
                "#,
            )?;
            for (repository, pr_number) in &batch.identities {
                insert.execute(params![batch.batch_id, repository, *pr_number as i64])?;
            }
        }
        tx.commit()?;

        tracing::debug!(
            batch_id = %batch.batch_id,
            status = status.as_str(),
            "recorded batch in catalog"
        );
        Ok(())
    }

    /// Batches for one organization, newest first.
    pub fn list_batches(&self, organization: &str) -> Result<Vec<CatalogBatch>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT batch_id, organization, window_days, collected_at, record_count, files_written, status
            FROM batches
            WHERE organization = ?1
            ORDER BY collected_at DESC, batch_id DESC
            "#,
        )?;

        let rows = stmt.query_map(params![organization], |row| {
            let collected_at: i64 = row.get(3)?;
            let record_count: i64 = row.get(4)?;
            let files_written: i64 = row.get(5)?;
            let status: String = row.get(6)?;
            Ok(CatalogBatch {
                batch_id: row.get(0)?,
                organization: row.get(1)?,
                window_days: row.get(2)?,
                collected_at: DateTime::from_timestamp_millis(collected_at).unwrap_or_default(),
                record_count: u64::try_from(record_count).unwrap_or(0),
                files_written: u64::try_from(files_written).unwrap_or(0),
                status: BatchStatus::parse(&status),
            })
        })?;

        let batches = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<Option<BatchStatus>, StoreError> {
        let status = self
            .conn
            .query_row(
                "SELECT status FROM batches WHERE batch_id = ?1",
                params![batch_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(status.map(|status| BatchStatus::parse(&status)))
    }

    pub fn identity_count(&self, batch_id: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM batch_identities WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn mark_expired(&self, batch_ids: &[String]) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        for batch_id in batch_ids {
            tx.execute(
                "UPDATE batches SET status = 'expired' WHERE batch_id = ?1",
                params![batch_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            batch_id TEXT PRIMARY KEY,
            organization TEXT NOT NULL,
            window_days INTEGER NOT NULL,
            collected_at INTEGER NOT NULL,
            record_count INTEGER NOT NULL,
            files_written INTEGER NOT NULL,
            status TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_batches_org_collected
            ON batches (organization, collected_at);

        CREATE TABLE IF NOT EXISTS batch_identities (
            batch_id TEXT NOT NULL,
            repository TEXT NOT NULL,
            pr_number INTEGER NOT NULL,
            PRIMARY KEY (batch_id, repository, pr_number)
        );
        "#,
    )?;

    Ok(())
}
