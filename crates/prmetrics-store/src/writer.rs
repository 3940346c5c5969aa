use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use prmetrics_core::{ColumnSet, CollectionBatch, PartitionKey, PullRequestRecord};
use serde::Serialize;

use crate::codec;
use crate::layout::{PartitionLayout, batch_file_name};
use crate::lock::PartitionLock;
use crate::{StoreError, StoredRow};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WrittenFile {
    pub partition: PartitionKey,
    pub path: PathBuf,
    pub rows: usize,
    pub columns: Vec<String>,
}

/// Rows of one partition that could not be written; the caller may retry them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferredPartition {
    pub partition: PartitionKey,
    pub reason: String,
    pub contended: bool,
    pub record_count: usize,
    #[serde(skip)]
    pub records: Vec<PullRequestRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteReport {
    pub batch_id: String,
    pub files: Vec<WrittenFile>,
    pub deferred: Vec<DeferredPartition>,
}

impl WriteReport {
    pub fn rows_written(&self) -> usize {
        self.files.iter().map(|file| file.rows).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty()
    }
}

/// Appends normalized records to the partition tree, one new file per partition and
/// optional-column set.
#[derive(Debug, Clone)]
pub struct PartitionWriter {
    layout: PartitionLayout,
    lock_timeout: Duration,
}

type ColumnGroups<'a> = BTreeMap<ColumnSet, Vec<&'a PullRequestRecord>>;

impl PartitionWriter {
    pub fn new(layout: PartitionLayout, lock_timeout: Duration) -> Self {
        Self {
            layout,
            lock_timeout,
        }
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Failures are confined to their partition and reported as deferred; other
    /// partitions are still written.
    pub fn write_batch(
        &self,
        batch: &CollectionBatch,
        records: &[PullRequestRecord],
    ) -> WriteReport {
        let mut partitions: BTreeMap<PartitionKey, ColumnGroups<'_>> = BTreeMap::new();
        for record in records {
            partitions
                .entry(record.partition_key())
                .or_default()
                .entry(record.observed_columns())
                .or_default()
                .push(record);
        }

        let mut report = WriteReport {
            batch_id: batch.batch_id.clone(),
            files: Vec::new(),
            deferred: Vec::new(),
        };

        for (key, groups) in partitions {
            let dir = self.layout.partition_dir(&key);
            let mut pending = groups.into_iter().collect::<Vec<_>>();

            let failure = match PartitionLock::acquire(&dir, self.lock_timeout) {
                Ok(_guard) => {
                    let mut failure = None;
                    while !pending.is_empty() {
                        let (columns, group) = &pending[0];
                        match write_group(&dir, &key, batch, columns, group) {
                            Ok(file) => {
                                report.files.push(file);
                                pending.remove(0);
                            }
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                    failure
                }
                Err(err) => Some(err),
            };

            if let Some(err) = failure {
                let records = pending
                    .into_iter()
                    .flat_map(|(_, group)| group.into_iter().cloned())
                    .collect::<Vec<_>>();
                tracing::warn!(
                    partition = %key,
                    rows = records.len(),
                    error = %err,
                    "deferring partition write"
                );
                report.deferred.push(DeferredPartition {
                    partition: key,
                    reason: err.to_string(),
                    contended: matches!(err, StoreError::WriteContention { .. }),
                    record_count: records.len(),
                    records,
                });
            }
        }

        tracing::info!(
            batch_id = %batch.batch_id,
            files = report.files.len(),
            rows = report.rows_written(),
            deferred = report.deferred.len(),
            "wrote collection batch"
        );
        report
    }
}

fn write_group(
    dir: &Path,
    key: &PartitionKey,
    batch: &CollectionBatch,
    columns: &ColumnSet,
    group: &[&PullRequestRecord],
) -> Result<WrittenFile, StoreError> {
    let rows = group
        .iter()
        .map(|record| StoredRow {
            record: (*record).clone(),
            batch_id: Some(batch.batch_id.clone()),
            batch_collected_at: batch.collected_at,
            source: PathBuf::new(),
        })
        .collect::<Vec<_>>();

    let mut sequence = 0;
    let mut file_name = batch_file_name(batch.collected_at, &batch.batch_id, sequence);
    while dir.join(&file_name).exists() {
        sequence += 1;
        file_name = batch_file_name(batch.collected_at, &batch.batch_id, sequence);
    }

    let path = codec::write_rows(dir, &file_name, &rows)?;
    tracing::debug!(partition = %key, path = %path.display(), rows = rows.len(), "appended partition file");

    Ok(WrittenFile {
        partition: key.clone(),
        path,
        rows: rows.len(),
        columns: columns
            .iter()
            .map(|column| column.as_str().to_owned())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use prmetrics_core::{Observed, Organization};
    use tempfile::tempdir;

    use super::*;
    use crate::codec::read_stored_rows;

    fn at(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, month, day, 9, 0, 0)
            .single()
            .expect("timestamp")
    }

    fn record(repository: &str, pr_number: u64, created_at: Option<DateTime<Utc>>) -> PullRequestRecord {
        PullRequestRecord {
            organization: "acme".to_owned(),
            repository: repository.to_owned(),
            pr_number,
            author: "alice".to_owned(),
            created_at,
            merged_at: None,
            closed_at: None,
            additions: 1,
            deletions: 1,
            is_draft: false,
            changed_files: Observed::Absent,
            review_decision: Observed::Absent,
            reviews_count: Observed::Absent,
            reviewers: Observed::Absent,
            merged_by: Observed::Absent,
            comments_count: Observed::Absent,
            commits_count: Observed::Absent,
            time_to_first_review_hours: Observed::Absent,
            labels: Observed::Absent,
            updated_at: Observed::Absent,
        }
    }

    fn batch() -> CollectionBatch {
        let org = Organization::new("acme").expect("org");
        CollectionBatch::new(&org, 14, at(3, 1))
    }

    #[test]
    fn groups_records_by_partition_and_column_set() {
        let temp = tempdir().expect("tempdir");
        let layout = PartitionLayout::new(temp.path());
        let writer = PartitionWriter::new(layout.clone(), Duration::from_millis(200));

        let mut with_reviews = record("svc", 3, Some(at(1, 5)));
        with_reviews.reviews_count = Observed::Present(1);
        let records = vec![
            record("svc", 1, Some(at(1, 5))),
            record("svc", 2, Some(at(2, 5))),
            with_reviews,
            record("svc", 4, None),
        ];

        let report = writer.write_batch(&batch(), &records);
        assert!(report.is_complete());
        assert_eq!(report.rows_written(), 4);
        assert_eq!(report.files.len(), 4);

        let partitions = layout.list_partitions(Some("acme")).expect("list");
        assert_eq!(partitions.len(), 3);
        let january = partitions
            .iter()
            .find(|partition| partition.key.period == Some((2025, 1)))
            .expect("january partition");
        assert_eq!(january.files.len(), 2);
        assert!(partitions.iter().any(|partition| partition.key.period.is_none()));

        for file in &report.files {
            let rows = read_stored_rows(&file.path).expect("read back");
            assert_eq!(rows.len(), file.rows);
            assert!(rows.iter().all(|row| row.batch_id.as_deref() == Some(report.batch_id.as_str())));
        }
    }

    #[test]
    fn rewriting_the_same_batch_appends_instead_of_overwriting() {
        let temp = tempdir().expect("tempdir");
        let writer = PartitionWriter::new(PartitionLayout::new(temp.path()), Duration::from_millis(200));
        let batch = batch();
        let records = vec![record("svc", 1, Some(at(1, 5)))];

        let first = writer.write_batch(&batch, &records);
        let second = writer.write_batch(&batch, &records);
        assert_ne!(first.files[0].path, second.files[0].path);
        assert!(first.files[0].path.exists());
    }

    #[test]
    fn locked_partition_is_deferred_without_blocking_others() {
        let temp = tempdir().expect("tempdir");
        let layout = PartitionLayout::new(temp.path());
        let writer = PartitionWriter::new(layout.clone(), Duration::from_millis(50));

        let blocked = record("blocked", 1, Some(at(1, 5)));
        let _held = PartitionLock::acquire(
            &layout.partition_dir(&blocked.partition_key()),
            Duration::from_millis(50),
        )
        .expect("hold lock");

        let records = vec![blocked, record("free", 2, Some(at(1, 5)))];
        let report = writer.write_batch(&batch(), &records);

        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].partition.repository, "free");
        assert_eq!(report.deferred.len(), 1);
        assert!(report.deferred[0].contended);
        assert_eq!(report.deferred[0].records.len(), 1);
        assert_eq!(report.deferred[0].records[0].repository, "blocked");
    }
}
