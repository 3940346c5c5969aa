use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prmetrics_core::PartitionKey;
use serde::{Deserialize, Serialize};

use crate::catalog::{BatchCatalog, BatchStatus, CatalogBatch};
use crate::codec;
use crate::dedup::dedupe;
use crate::layout::{PartitionDir, PartitionLayout, batch_file_name, data_files};
use crate::lock::PartitionLock;
use crate::{StoreError, StoredRow};

const CONSOLIDATED_BATCH_ID: &str = "consolidated";

/// Which collection batches stay visible. Both limits are optional and combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_batches: Option<u32>,
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.keep_batches.is_none() && self.max_age_days.is_none()
    }

    /// `batches` must be ordered newest first, as [`BatchCatalog::list_batches`] returns them.
    pub fn expired_batches(&self, batches: &[CatalogBatch], now: DateTime<Utc>) -> BTreeSet<String> {
        let cutoff = self
            .max_age_days
            .map(|days| now - chrono::Duration::days(i64::from(days)));

        batches
            .iter()
            .enumerate()
            .filter(|(index, batch)| {
                let beyond_count = self
                    .keep_batches
                    .is_some_and(|keep| *index >= keep as usize);
                let too_old = cutoff.is_some_and(|cutoff| batch.collected_at < cutoff);
                beyond_count || too_old || batch.status == BatchStatus::Expired
            })
            .map(|(_, batch)| batch.batch_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationOptions {
    pub organization: String,
    pub retention: RetentionPolicy,
    pub dry_run: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionFailure {
    pub partition: PartitionKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationSummary {
    pub dry_run: bool,
    pub expired_batches: Vec<String>,
    pub partitions_scanned: usize,
    pub partitions_compacted: usize,
    pub files_before: usize,
    pub files_after: usize,
    pub records_before: usize,
    pub records_after: usize,
    pub records_expired: usize,
    pub duplicates_removed: usize,
    pub integrity_conflicts: usize,
    pub bytes_reclaimed: u64,
    pub aborted: Vec<PartitionFailure>,
}

struct PartitionOutcome {
    files_before: usize,
    files_after: usize,
    records_before: usize,
    records_after: usize,
    records_expired: usize,
    duplicates_removed: usize,
    integrity_conflicts: usize,
    bytes_before: u64,
    bytes_after: u64,
}

/// Re-reads a freshly written file and returns its row count.
pub type RowCounter = fn(&Path) -> Result<usize, StoreError>;

fn count_rows(path: &Path) -> Result<usize, StoreError> {
    codec::read_stored_rows(path).map(|rows| rows.len())
}

/// Rewrites each partition as one deduplicated file and drops rows of expired batches.
#[derive(Debug, Clone)]
pub struct Consolidator {
    layout: PartitionLayout,
    lock_timeout: Duration,
    row_counter: RowCounter,
}

impl Consolidator {
    pub fn new(layout: PartitionLayout, lock_timeout: Duration) -> Self {
        Self {
            layout,
            lock_timeout,
            row_counter: count_rows,
        }
    }

    /// Replaces the check that runs on every rewritten file before originals are deleted.
    pub fn with_row_counter(mut self, row_counter: RowCounter) -> Self {
        self.row_counter = row_counter;
        self
    }

    pub fn run(
        &self,
        catalog: &BatchCatalog,
        options: &ConsolidationOptions,
    ) -> Result<ConsolidationSummary, StoreError> {
        let batches = catalog.list_batches(&options.organization)?;
        let expired = options.retention.expired_batches(&batches, options.now);

        let mut summary = ConsolidationSummary {
            dry_run: options.dry_run,
            expired_batches: expired.iter().cloned().collect(),
            ..ConsolidationSummary::default()
        };

        for partition in self.layout.list_partitions(Some(&options.organization))? {
            if partition.files.is_empty() {
                continue;
            }
            summary.partitions_scanned += 1;

            match self.consolidate_partition(&partition, &expired, options) {
                Ok(Some(outcome)) => {
                    summary.partitions_compacted += 1;
                    summary.files_before += outcome.files_before;
                    summary.files_after += outcome.files_after;
                    summary.records_before += outcome.records_before;
                    summary.records_after += outcome.records_after;
                    summary.records_expired += outcome.records_expired;
                    summary.duplicates_removed += outcome.duplicates_removed;
                    summary.integrity_conflicts += outcome.integrity_conflicts;
                    summary.bytes_reclaimed +=
                        outcome.bytes_before.saturating_sub(outcome.bytes_after);
                }
                Ok(None) => {
                    summary.files_before += partition.files.len();
                    summary.files_after += partition.files.len();
                }
                Err(err) => {
                    tracing::warn!(
                        partition = %partition.key,
                        error = %err,
                        "consolidation aborted for partition; originals kept"
                    );
                    summary.files_before += partition.files.len();
                    summary.files_after += partition.files.len();
                    summary.aborted.push(PartitionFailure {
                        partition: partition.key.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if !options.dry_run && !summary.expired_batches.is_empty() {
            catalog.mark_expired(&summary.expired_batches)?;
        }

        tracing::info!(
            organization = %options.organization,
            dry_run = options.dry_run,
            compacted = summary.partitions_compacted,
            files_before = summary.files_before,
            files_after = summary.files_after,
            records_expired = summary.records_expired,
            aborted = summary.aborted.len(),
            "consolidation finished"
        );
        Ok(summary)
    }

    fn consolidate_partition(
        &self,
        partition: &PartitionDir,
        expired: &BTreeSet<String>,
        options: &ConsolidationOptions,
    ) -> Result<Option<PartitionOutcome>, StoreError> {
        let _guard = if options.dry_run {
            None
        } else {
            Some(PartitionLock::acquire(&partition.path, self.lock_timeout)?)
        };
        // Another writer may have appended between listing and locking.
        let files = if options.dry_run {
            partition.files.clone()
        } else {
            data_files(&partition.path)?
        };

        let mut rows = Vec::new();
        let mut bytes_before = 0;
        for file in &files {
            rows.extend(codec::read_stored_rows(file)?);
            bytes_before += fs::metadata(file)?.len();
        }
        let records_before = rows.len();

        let (kept, dropped): (Vec<StoredRow>, Vec<StoredRow>) = rows.into_iter().partition(|row| {
            !row.batch_id
                .as_ref()
                .is_some_and(|batch_id| expired.contains(batch_id))
        });
        if files.len() <= 1 && dropped.is_empty() {
            return Ok(None);
        }

        let report = dedupe(kept);
        let expected = report.rows.len();
        let mut outcome = PartitionOutcome {
            files_before: files.len(),
            files_after: usize::from(expected > 0),
            records_before,
            records_after: expected,
            records_expired: dropped.len(),
            duplicates_removed: report.duplicates_removed,
            integrity_conflicts: report.conflicts.len(),
            bytes_before,
            bytes_after: bytes_before,
        };
        if options.dry_run {
            return Ok(Some(outcome));
        }

        let written = if expected > 0 {
            let path = self.write_canonical(&partition.path, &report.rows, options.now)?;
            match (self.row_counter)(&path) {
                Ok(found) if found == expected => {}
                Ok(found) => {
                    remove_quietly(&path);
                    return Err(StoreError::ConsolidationAbort {
                        partition: partition.key.to_string(),
                        expected,
                        found,
                    });
                }
                Err(err) => {
                    remove_quietly(&path);
                    return Err(err);
                }
            }
            outcome.bytes_after = fs::metadata(&path)?.len();
            Some(path)
        } else {
            outcome.bytes_after = 0;
            None
        };

        for file in &files {
            if written.as_deref() == Some(file.as_path()) {
                continue;
            }
            fs::remove_file(file)?;
        }

        tracing::debug!(
            partition = %partition.key,
            files_before = outcome.files_before,
            rows = expected,
            expired = outcome.records_expired,
            "consolidated partition"
        );
        Ok(Some(outcome))
    }

    fn write_canonical(
        &self,
        dir: &Path,
        rows: &[StoredRow],
        now: DateTime<Utc>,
    ) -> Result<PathBuf, StoreError> {
        let mut sequence = 0;
        let mut file_name = batch_file_name(now, CONSOLIDATED_BATCH_ID, sequence);
        while dir.join(&file_name).exists() {
            sequence += 1;
            file_name = batch_file_name(now, CONSOLIDATED_BATCH_ID, sequence);
        }
        codec::write_rows(dir, &file_name, rows)
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove rejected consolidation output");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0)
            .single()
            .expect("timestamp")
    }

    fn catalog_batch(batch_id: &str, day: u32, status: BatchStatus) -> CatalogBatch {
        CatalogBatch {
            batch_id: batch_id.to_owned(),
            organization: "acme".to_owned(),
            window_days: 14,
            collected_at: at(day),
            record_count: 1,
            files_written: 1,
            status,
        }
    }

    #[test]
    fn keep_count_and_age_limits_combine() {
        let batches = vec![
            catalog_batch("d", 20, BatchStatus::Complete),
            catalog_batch("c", 15, BatchStatus::Complete),
            catalog_batch("b", 10, BatchStatus::Complete),
            catalog_batch("a", 1, BatchStatus::Complete),
        ];

        let keep_two = RetentionPolicy {
            keep_batches: Some(2),
            max_age_days: None,
        };
        assert_eq!(
            keep_two.expired_batches(&batches, at(21)),
            ["a".to_owned(), "b".to_owned()].into_iter().collect()
        );

        let young = RetentionPolicy {
            keep_batches: None,
            max_age_days: Some(8),
        };
        assert_eq!(
            young.expired_batches(&batches, at(21)),
            ["a".to_owned(), "b".to_owned()].into_iter().collect()
        );

        let both = RetentionPolicy {
            keep_batches: Some(3),
            max_age_days: Some(7),
        };
        assert_eq!(both.expired_batches(&batches, at(21)).len(), 2);

        assert!(RetentionPolicy::default().is_unbounded());
        assert!(RetentionPolicy::default()
            .expired_batches(&batches, at(21))
            .is_empty());
    }

    #[test]
    fn previously_expired_batches_stay_expired() {
        let batches = vec![
            catalog_batch("new", 20, BatchStatus::Complete),
            catalog_batch("gone", 19, BatchStatus::Expired),
        ];
        let expired = RetentionPolicy::default().expired_batches(&batches, at(21));
        assert_eq!(expired, ["gone".to_owned()].into_iter().collect());
    }
}
