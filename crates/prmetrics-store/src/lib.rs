use std::path::PathBuf;

use chrono::{DateTime, Utc};
use prmetrics_core::{ColumnSet, PullRequestRecord};
use thiserror::Error;

mod backend;
mod catalog;
mod codec;
mod consolidate;
mod dedup;
mod layout;
mod lock;
mod writer;

pub use backend::{
    LegacyFileName, LegacyFlatStore, MetricsStore, PartitionedStore, RecordSource, ScanReport,
    SkippedFile, StorageBackend,
};
pub use catalog::{BatchCatalog, BatchStatus, CatalogBatch};
pub use consolidate::{
    ConsolidationOptions, ConsolidationSummary, Consolidator, PartitionFailure, RetentionPolicy,
};
pub use dedup::{DedupReport, IntegrityConflict, dedupe, prefer};
pub use layout::{LOCK_FILE_NAME, PartitionDir, PartitionLayout};
pub use lock::PartitionLock;
pub use writer::{DeferredPartition, PartitionWriter, WriteReport, WrittenFile};

pub const CATALOG_FILE_NAME: &str = "catalog.sqlite";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("partition {partition} is locked by another writer (waited {waited_ms} ms)")]
    WriteContention { partition: String, waited_ms: u64 },
    #[error(
        "consolidation of {partition} aborted: wrote {found} rows but expected {expected}"
    )]
    ConsolidationAbort {
        partition: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid stored data in {path}: {message}")]
    InvalidData { path: PathBuf, message: String },
}

/// A record as read back from storage, with the batch it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub record: PullRequestRecord,
    pub batch_id: Option<String>,
    pub batch_collected_at: DateTime<Utc>,
    pub source: PathBuf,
}

impl StoredRow {
    /// Optional columns the source file carried for this row.
    pub fn columns(&self) -> ColumnSet {
        self.record.observed_columns()
    }
}
