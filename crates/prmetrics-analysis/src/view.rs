use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use prmetrics_config::QueryConfig;
use prmetrics_core::{Observed, OptionalColumn, Organization, PullRequestRecord};
use prmetrics_store::{RecordSource, dedupe};
use serde::{Deserialize, Serialize};

use crate::AnalysisError;

static EMPTY_SET: BTreeSet<String> = BTreeSet::new();

/// What a query runs over: one organization, optionally one repository, and the
/// trailing `day_window` days ending at `now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryScope {
    pub organization: String,
    pub repository: Option<String>,
    pub day_window: u32,
    pub min_prs: usize,
    pub now: DateTime<Utc>,
}

impl QueryScope {
    pub fn new(organization: &Organization, query: &QueryConfig, now: DateTime<Utc>) -> Self {
        Self {
            organization: organization.as_str().to_owned(),
            repository: None,
            day_window: query.day_window,
            min_prs: query.min_prs,
            now,
        }
    }

    pub fn with_repository(mut self, repository: Option<&str>) -> Self {
        self.repository = repository
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned);
        self
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.now - Duration::days(i64::from(self.day_window))
    }

    /// Rows without `created_at` never fall inside a window.
    pub fn contains(&self, record: &PullRequestRecord) -> bool {
        let Some(created_at) = record.created_at else {
            return false;
        };
        if created_at < self.window_start() {
            return false;
        }
        self.repository
            .as_deref()
            .is_none_or(|repository| record.repository == repository)
    }
}

/// Value a query uses for a row whose source file never carried the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NeutralDefault {
    Zero,
    Null,
    EmptySet,
}

pub fn neutral_default(column: OptionalColumn) -> NeutralDefault {
    match column {
        OptionalColumn::ReviewsCount
        | OptionalColumn::CommentsCount
        | OptionalColumn::CommitsCount
        | OptionalColumn::ChangedFiles => NeutralDefault::Zero,
        OptionalColumn::Reviewers | OptionalColumn::Labels => NeutralDefault::EmptySet,
        OptionalColumn::TimeToFirstReviewHours
        | OptionalColumn::ReviewDecision
        | OptionalColumn::MergedBy
        | OptionalColumn::UpdatedAt => NeutralDefault::Null,
    }
}

pub(crate) fn reviews_count(record: &PullRequestRecord) -> u32 {
    match &record.reviews_count {
        Observed::Present(count) => *count,
        Observed::Absent => 0,
    }
}

pub(crate) fn reviewers(record: &PullRequestRecord) -> &BTreeSet<String> {
    match &record.reviewers {
        Observed::Present(reviewers) => reviewers,
        Observed::Absent => &EMPTY_SET,
    }
}

pub(crate) fn self_merged(record: &PullRequestRecord) -> Option<bool> {
    record.self_merged().into_present().flatten()
}

pub(crate) fn time_to_first_review_hours(record: &PullRequestRecord) -> Option<f64> {
    record.time_to_first_review_hours.present().copied().flatten()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataCompleteness {
    pub partial: bool,
    pub missing_columns: Vec<String>,
    /// Value substituted for each missing column.
    pub neutral_defaults: BTreeMap<String, NeutralDefault>,
}

impl DataCompleteness {
    pub fn merge(&mut self, other: &DataCompleteness) {
        self.partial |= other.partial;
        for column in &other.missing_columns {
            if !self.missing_columns.contains(column) {
                self.missing_columns.push(column.clone());
            }
        }
        self.missing_columns.sort();
        self.neutral_defaults.extend(
            other
                .neutral_defaults
                .iter()
                .map(|(column, default)| (column.clone(), *default)),
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewStats {
    pub files_read: usize,
    pub skipped_files: usize,
    pub rows_scanned: usize,
    pub duplicates_removed: usize,
    pub integrity_conflicts: usize,
    pub rows_in_scope: usize,
    /// Repositories dropped from an organization-wide view for having fewer than `min_prs`.
    pub excluded_repositories: Vec<String>,
}

/// Deduplicated rows inside one [`QueryScope`], with per-column coverage.
#[derive(Debug, Clone)]
pub struct MetricsView {
    scope: QueryScope,
    records: Vec<PullRequestRecord>,
    coverage: BTreeMap<OptionalColumn, usize>,
    stats: ViewStats,
}

impl MetricsView {
    pub fn load<S>(source: &S, scope: QueryScope) -> Result<Self, AnalysisError>
    where
        S: RecordSource + ?Sized,
    {
        let scan = source.scan(&scope.organization)?;
        let files_read = scan.files_read;
        let skipped_files = scan.skipped.len();
        let report = dedupe(scan.rows);

        let mut view = Self::from_records(scope, report.rows.into_iter().map(|row| row.record));
        view.stats.files_read = files_read;
        view.stats.skipped_files = skipped_files;
        view.stats.rows_scanned = report.input_rows;
        view.stats.duplicates_removed = report.duplicates_removed;
        view.stats.integrity_conflicts = report.conflicts.len();

        tracing::info!(
            organization = %view.scope.organization,
            files = files_read,
            rows = view.records.len(),
            duplicates = report.duplicates_removed,
            "loaded metrics view"
        );
        Ok(view)
    }

    /// Applies the scope to records that are already one per identity.
    pub fn from_records(
        scope: QueryScope,
        records: impl IntoIterator<Item = PullRequestRecord>,
    ) -> Self {
        let mut rows_scanned = 0;
        let mut in_scope = records
            .into_iter()
            .inspect(|_| rows_scanned += 1)
            .filter(|record| scope.contains(record))
            .collect::<Vec<_>>();

        let mut excluded_repositories = Vec::new();
        if scope.repository.is_none() {
            let mut per_repository = BTreeMap::<String, usize>::new();
            for record in &in_scope {
                *per_repository.entry(record.repository.clone()).or_default() += 1;
            }
            excluded_repositories = per_repository
                .into_iter()
                .filter(|(_, count)| *count < scope.min_prs)
                .map(|(repository, _)| repository)
                .collect();
            in_scope.retain(|record| {
                excluded_repositories
                    .binary_search(&record.repository)
                    .is_err()
            });
            if in_scope.is_empty() && !excluded_repositories.is_empty() {
                tracing::warn!(
                    organization = %scope.organization,
                    min_prs = scope.min_prs,
                    excluded = excluded_repositories.len(),
                    "no repository reaches min_prs; organization view is empty"
                );
            }
        }
        in_scope.sort_by_key(PullRequestRecord::identity);

        let mut coverage = BTreeMap::new();
        for record in &in_scope {
            for column in record.observed_columns() {
                *coverage.entry(column).or_default() += 1;
            }
        }

        let stats = ViewStats {
            rows_scanned,
            rows_in_scope: in_scope.len(),
            excluded_repositories,
            ..ViewStats::default()
        };
        Self {
            scope,
            records: in_scope,
            coverage,
            stats,
        }
    }

    pub fn scope(&self) -> &QueryScope {
        &self.scope
    }

    pub fn records(&self) -> &[PullRequestRecord] {
        &self.records
    }

    pub fn stats(&self) -> &ViewStats {
        &self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reports which of `columns` are missing from at least one row; logged once per call.
    pub fn completeness(&self, query: &'static str, columns: &[OptionalColumn]) -> DataCompleteness {
        let neutral_defaults = columns
            .iter()
            .filter(|column| {
                self.coverage.get(*column).copied().unwrap_or(0) < self.records.len()
            })
            .map(|column| (column.as_str().to_owned(), neutral_default(*column)))
            .collect::<BTreeMap<_, _>>();

        if !neutral_defaults.is_empty() {
            tracing::warn!(
                query,
                defaults = ?neutral_defaults,
                rows = self.records.len(),
                "schema mismatch: using neutral defaults for missing columns"
            );
        }
        DataCompleteness {
            partial: !neutral_defaults.is_empty(),
            missing_columns: neutral_defaults.keys().cloned().collect(),
            neutral_defaults,
        }
    }
}
