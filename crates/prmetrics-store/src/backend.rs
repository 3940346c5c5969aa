use std::fs;
use std::path::{Path, PathBuf};

use arrow_array::RecordBatch;
use chrono::{DateTime, NaiveDateTime, Utc};
use prmetrics_core::{Observed, PullRequestRecord};
use serde::Serialize;

use crate::codec::{
    self, bool_at, f64_at, string_at, string_set_at, timestamp_at, u32_at, u64_at,
};
use crate::layout::PartitionLayout;
use crate::{StoreError, StoredRow};

const LEGACY_PREFIX: &str = "pr_data_";
const LEGACY_EXTENSION: &str = ".parquet";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Raw, not yet deduplicated, rows read from a source.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub rows: Vec<StoredRow>,
    pub files_read: usize,
    pub skipped: Vec<SkippedFile>,
}

impl ScanReport {
    pub fn merge(&mut self, other: ScanReport) {
        self.rows.extend(other.rows);
        self.files_read += other.files_read;
        self.skipped.extend(other.skipped);
    }

    fn skip(&mut self, path: &Path, err: &StoreError) {
        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable data file");
        self.skipped.push(SkippedFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        });
    }
}

/// Anything the deduplicator and query engine can read pull requests from.
pub trait RecordSource {
    fn scan(&self, organization: &str) -> Result<ScanReport, StoreError>;
}

/// The Hive-style partition tree written by [`crate::PartitionWriter`].
#[derive(Debug, Clone)]
pub struct PartitionedStore {
    layout: PartitionLayout,
}

impl PartitionedStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: PartitionLayout::new(data_dir),
        }
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }
}

impl RecordSource for PartitionedStore {
    fn scan(&self, organization: &str) -> Result<ScanReport, StoreError> {
        let mut report = ScanReport::default();
        for partition in self.layout.list_partitions(Some(organization))? {
            for file in &partition.files {
                match codec::read_stored_rows(file) {
                    Ok(rows) => {
                        report.files_read += 1;
                        report.rows.extend(rows);
                    }
                    Err(err) => report.skip(file, &err),
                }
            }
        }
        tracing::debug!(
            organization,
            files = report.files_read,
            rows = report.rows.len(),
            "scanned partitioned store"
        );
        Ok(report)
    }
}

/// Flat `pr_data_<org>_<YYYYMMDD_HHMMSS>.parquet` files from the first collector.
/// Each file is one batch covering all time for its organization.
#[derive(Debug, Clone)]
pub struct LegacyFlatStore {
    dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFileName {
    pub organization: String,
    pub collected_at: DateTime<Utc>,
}

impl LegacyFileName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix(LEGACY_PREFIX)?
            .strip_suffix(LEGACY_EXTENSION)?;
        let (rest, time) = stem.rsplit_once('_')?;
        let (organization, date) = rest.rsplit_once('_')?;
        if organization.is_empty() {
            return None;
        }
        let collected_at =
            NaiveDateTime::parse_from_str(&format!("{date}_{time}"), "%Y%m%d_%H%M%S").ok()?;
        Some(Self {
            organization: organization.to_owned(),
            collected_at: collected_at.and_utc(),
        })
    }
}

impl LegacyFlatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Files for one organization, newest first.
    pub fn files_for(
        &self,
        organization: &str,
    ) -> Result<Vec<(PathBuf, LegacyFileName)>, StoreError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().and_then(LegacyFileName::parse) else {
                continue;
            };
            if name.organization == organization {
                files.push((entry.path(), name));
            }
        }
        files.sort_by(|left, right| {
            right
                .1
                .collected_at
                .cmp(&left.1.collected_at)
                .then_with(|| right.0.cmp(&left.0))
        });
        Ok(files)
    }
}

impl RecordSource for LegacyFlatStore {
    fn scan(&self, organization: &str) -> Result<ScanReport, StoreError> {
        let mut report = ScanReport::default();
        for (path, name) in self.files_for(organization)? {
            match read_legacy_file(&path, &name) {
                Ok(rows) => {
                    report.files_read += 1;
                    report.rows.extend(rows);
                }
                Err(err) => report.skip(&path, &err),
            }
        }
        if report.files_read > 0 {
            tracing::info!(
                organization,
                files = report.files_read,
                rows = report.rows.len(),
                "loaded legacy flat files"
            );
        }
        Ok(report)
    }
}

fn read_legacy_file(path: &Path, name: &LegacyFileName) -> Result<Vec<StoredRow>, StoreError> {
    let contents = codec::read_file(path)?;
    let mut rows = Vec::new();
    for batch in &contents.batches {
        rows.extend(decode_legacy(batch, name, path)?);
    }
    Ok(rows)
}

fn decode_legacy(
    batch: &RecordBatch,
    name: &LegacyFileName,
    path: &Path,
) -> Result<Vec<StoredRow>, StoreError> {
    let missing = |column: &str| StoreError::InvalidData {
        path: path.to_path_buf(),
        message: format!("legacy file is missing column '{column}'"),
    };
    let repo = batch
        .column_by_name("repo")
        .or_else(|| batch.column_by_name("repository"))
        .ok_or_else(|| missing("repo"))?;
    let pr_number = batch
        .column_by_name("pr_number")
        .ok_or_else(|| missing("pr_number"))?;
    let author = batch
        .column_by_name("author")
        .ok_or_else(|| missing("author"))?;
    let created_at = batch.column_by_name("created_at");
    let merged_at = batch.column_by_name("merged_at");
    let state = batch.column_by_name("state");
    let pr_size = batch.column_by_name("pr_size");
    let commits = batch.column_by_name("commits");
    let reviews = batch.column_by_name("reviews");
    let first_review = batch.column_by_name("time_to_first_review_hours");
    let is_draft = batch.column_by_name("is_draft");
    let labels = batch.column_by_name("labels");

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let (Some(repository), Some(pr_number), Some(author)) = (
            string_at(repo.as_ref(), row),
            u64_at(pr_number.as_ref(), row),
            string_at(author.as_ref(), row),
        ) else {
            continue;
        };

        let created_at = created_at.and_then(|array| timestamp_at(array.as_ref(), row));
        let merged_at = merged_at.and_then(|array| timestamp_at(array.as_ref(), row));
        let state = state
            .and_then(|array| string_at(array.as_ref(), row))
            .map(|value| value.to_ascii_lowercase());
        // Legacy rows never stored closedAt; a closed PR is dated by its creation.
        let closed_at = match state.as_deref() {
            _ if merged_at.is_some() => merged_at,
            Some("closed") => created_at,
            _ => None,
        };

        let record = PullRequestRecord {
            organization: name.organization.clone(),
            repository,
            pr_number,
            author,
            created_at,
            merged_at,
            closed_at,
            additions: pr_size
                .and_then(|array| u64_at(array.as_ref(), row))
                .unwrap_or(0),
            deletions: 0,
            is_draft: is_draft
                .and_then(|array| bool_at(array.as_ref(), row))
                .unwrap_or(false),
            changed_files: Observed::Absent,
            review_decision: Observed::Absent,
            reviews_count: reviews
                .map(|array| u32_at(array.as_ref(), row))
                .into(),
            reviewers: Observed::Absent,
            merged_by: Observed::Absent,
            comments_count: Observed::Absent,
            commits_count: commits
                .map(|array| u32_at(array.as_ref(), row))
                .into(),
            time_to_first_review_hours: first_review
                .map(|array| f64_at(array.as_ref(), row).map(|hours| hours.max(0.0)))
                .into(),
            labels: labels
                .map(|array| string_set_at(array.as_ref(), row).unwrap_or_default())
                .into(),
            updated_at: Observed::Absent,
        };

        rows.push(StoredRow {
            record,
            batch_id: None,
            batch_collected_at: name.collected_at,
            source: path.to_path_buf(),
        });
    }
    Ok(rows)
}

/// The two physical formats one logical store can be made of.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    Partitioned(PartitionedStore),
    LegacyFlat(LegacyFlatStore),
}

impl RecordSource for StorageBackend {
    fn scan(&self, organization: &str) -> Result<ScanReport, StoreError> {
        match self {
            Self::Partitioned(store) => store.scan(organization),
            Self::LegacyFlat(store) => store.scan(organization),
        }
    }
}

/// Partitioned data plus any legacy flat files, read as one source.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    backends: Vec<StorageBackend>,
}

impl MetricsStore {
    pub fn new(backends: Vec<StorageBackend>) -> Self {
        Self { backends }
    }

    pub fn open(data_dir: impl Into<PathBuf>, legacy_dir: impl Into<PathBuf>) -> Self {
        Self::new(vec![
            StorageBackend::Partitioned(PartitionedStore::new(data_dir)),
            StorageBackend::LegacyFlat(LegacyFlatStore::new(legacy_dir)),
        ])
    }
}

impl RecordSource for MetricsStore {
    fn scan(&self, organization: &str) -> Result<ScanReport, StoreError> {
        let mut report = ScanReport::default();
        for backend in &self.backends {
            report.merge(backend.scan(organization)?);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn legacy_file_names_carry_organization_and_timestamp() {
        let parsed = LegacyFileName::parse("pr_data_eve-world_20250214_093000.parquet")
            .expect("parse legacy name");
        assert_eq!(parsed.organization, "eve-world");
        assert_eq!(
            parsed.collected_at,
            Utc.with_ymd_and_hms(2025, 2, 14, 9, 30, 0)
                .single()
                .expect("timestamp")
        );

        assert!(LegacyFileName::parse("pr_data_acme_20250214.parquet").is_none());
        assert!(LegacyFileName::parse("pr_data_acme_20250214_093000.csv").is_none());
        assert!(LegacyFileName::parse("pr_data__20250214_093000.parquet").is_none());
        assert!(LegacyFileName::parse("other_acme_20250214_093000.parquet").is_none());
    }
}
