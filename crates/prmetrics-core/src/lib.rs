use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

mod normalize;

pub use normalize::{
    NormalizationError, NormalizationReport, RejectedRecord, SizeBucket, SizeThresholds,
    normalize_batch, normalize_record, size_bucket,
};

/// Partition value DuckDB and Hive use for a null partition column.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Organization name in its filesystem-safe form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Organization(String);

impl Organization {
    /// Returns `None` when the name is blank after sanitizing.
    pub fn new(raw: &str) -> Option<Self> {
        let sanitized = sanitize_name(raw);
        if sanitized.is_empty() {
            return None;
        }
        Some(Self(sanitized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sanitize_name(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', '_'], "-")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub organization: String,
    pub repository: String,
    pub pr_number: u64,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.organization, self.repository, self.pr_number
        )
    }
}

/// Value of an optional column: either the collection run did not ask for it,
/// or it did and this is what came back (which may itself be null or empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum Observed<T> {
    Absent,
    Present(T),
}

impl<T> Default for Observed<T> {
    fn default() -> Self {
        Self::Absent
    }
}

impl<T> Observed<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn present(&self) -> Option<&T> {
        match self {
            Self::Present(value) => Some(value),
            Self::Absent => None,
        }
    }

    pub fn into_present(self) -> Option<T> {
        match self {
            Self::Present(value) => Some(value),
            Self::Absent => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Observed<U> {
        match self {
            Self::Present(value) => Observed::Present(f(value)),
            Self::Absent => Observed::Absent,
        }
    }
}

impl<T> From<Option<T>> for Observed<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Present(value),
            None => Self::Absent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalColumn {
    ReviewsCount,
    Reviewers,
    TimeToFirstReviewHours,
    ReviewDecision,
    MergedBy,
    CommentsCount,
    CommitsCount,
    ChangedFiles,
    Labels,
    UpdatedAt,
}

impl OptionalColumn {
    pub const ALL: [Self; 10] = [
        Self::ReviewsCount,
        Self::Reviewers,
        Self::TimeToFirstReviewHours,
        Self::ReviewDecision,
        Self::MergedBy,
        Self::CommentsCount,
        Self::CommitsCount,
        Self::ChangedFiles,
        Self::Labels,
        Self::UpdatedAt,
    ];

    /// Column name in the stored files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReviewsCount => "reviews_count",
            Self::Reviewers => "reviewers",
            Self::TimeToFirstReviewHours => "time_to_first_review_hours",
            Self::ReviewDecision => "review_decision",
            Self::MergedBy => "merged_by",
            Self::CommentsCount => "comments_count",
            Self::CommitsCount => "commits_count",
            Self::ChangedFiles => "changed_files",
            Self::Labels => "labels",
            Self::UpdatedAt => "updated_at",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|column| column.as_str() == name)
    }
}

impl fmt::Display for OptionalColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ColumnSet = BTreeSet<OptionalColumn>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
    #[serde(rename = "none")]
    NoDecision,
}

impl ReviewDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::ReviewRequired => "review_required",
            Self::NoDecision => "none",
        }
    }

    /// Accepts both the stored snake_case names and the API's upper-case names.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" => Self::Approved,
            "changes_requested" => Self::ChangesRequested,
            "review_required" => Self::ReviewRequired,
            _ => Self::NoDecision,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl PrState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        }
    }
}

/// One pull request as of its last observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub organization: String,
    pub repository: String,
    pub pr_number: u64,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub additions: u64,
    pub deletions: u64,
    pub is_draft: bool,
    pub changed_files: Observed<u64>,
    pub review_decision: Observed<ReviewDecision>,
    pub reviews_count: Observed<u32>,
    pub reviewers: Observed<BTreeSet<String>>,
    pub merged_by: Observed<Option<String>>,
    pub comments_count: Observed<u32>,
    pub commits_count: Observed<u32>,
    pub time_to_first_review_hours: Observed<Option<f64>>,
    pub labels: Observed<BTreeSet<String>>,
    pub updated_at: Observed<Option<DateTime<Utc>>>,
}

impl PullRequestRecord {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            organization: self.organization.clone(),
            repository: self.repository.clone(),
            pr_number: self.pr_number,
        }
    }

    pub fn is_merged(&self) -> bool {
        self.merged_at.is_some()
    }

    pub fn state(&self) -> PrState {
        if self.merged_at.is_some() {
            PrState::Merged
        } else if self.closed_at.is_some() {
            PrState::Closed
        } else {
            PrState::Open
        }
    }

    /// Lines changed, `additions + deletions`.
    pub fn size(&self) -> u64 {
        self.additions.saturating_add(self.deletions)
    }

    pub fn time_to_merge_hours(&self) -> Option<f64> {
        match (self.created_at, self.merged_at) {
            (Some(created), Some(merged)) => Some(hours_between(created, merged)),
            _ => None,
        }
    }

    /// Absent when `merged_by` was not collected; null when nobody merged it.
    pub fn self_merged(&self) -> Observed<Option<bool>> {
        match &self.merged_by {
            Observed::Absent => Observed::Absent,
            Observed::Present(Some(merged_by)) if self.is_merged() => {
                Observed::Present(Some(merged_by == &self.author))
            }
            Observed::Present(_) => Observed::Present(None),
        }
    }

    pub fn observed_columns(&self) -> ColumnSet {
        let flags = [
            (OptionalColumn::ReviewsCount, self.reviews_count.is_present()),
            (OptionalColumn::Reviewers, self.reviewers.is_present()),
            (
                OptionalColumn::TimeToFirstReviewHours,
                self.time_to_first_review_hours.is_present(),
            ),
            (
                OptionalColumn::ReviewDecision,
                self.review_decision.is_present(),
            ),
            (OptionalColumn::MergedBy, self.merged_by.is_present()),
            (OptionalColumn::CommentsCount, self.comments_count.is_present()),
            (OptionalColumn::CommitsCount, self.commits_count.is_present()),
            (OptionalColumn::ChangedFiles, self.changed_files.is_present()),
            (OptionalColumn::Labels, self.labels.is_present()),
            (OptionalColumn::UpdatedAt, self.updated_at.is_present()),
        ];
        flags
            .into_iter()
            .filter(|(_, present)| *present)
            .map(|(column, _)| column)
            .collect()
    }

    /// Latest moment this record is known to reflect.
    pub fn update_marker(&self) -> Option<DateTime<Utc>> {
        if let Observed::Present(Some(updated_at)) = self.updated_at {
            return Some(updated_at);
        }
        [self.closed_at, self.merged_at, self.created_at]
            .into_iter()
            .flatten()
            .max()
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            organization: self.organization.clone(),
            repository: self.repository.clone(),
            period: self
                .created_at
                .map(|created| (created.year(), created.month())),
        }
    }

    /// Content hash over the canonical JSON encoding.
    pub fn fingerprint(&self) -> String {
        let encoded =
            serde_json::to_vec(self).unwrap_or_else(|_| format!("{self:?}").into_bytes());
        blake3_hex(&encoded)
    }
}

/// Physical grouping of stored rows. `period` is `None` for rows without `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub organization: String,
    pub repository: String,
    pub period: Option<(i32, u32)>,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.period {
            Some((year, month)) => write!(
                f,
                "{}/{}/{year:04}-{month:02}",
                self.organization, self.repository
            ),
            None => write!(f, "{}/{}/undated", self.organization, self.repository),
        }
    }
}

/// Metadata for one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionBatch {
    pub batch_id: String,
    pub organization: String,
    pub window_days: u32,
    pub collected_at: DateTime<Utc>,
    pub identities: BTreeSet<(String, u64)>,
}

impl CollectionBatch {
    pub fn new(organization: &Organization, window_days: u32, collected_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: compute_batch_id(organization.as_str(), collected_at, std::process::id()),
            organization: organization.as_str().to_owned(),
            window_days,
            collected_at,
            identities: BTreeSet::new(),
        }
    }

    pub fn record_identities<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a PullRequestRecord>,
    ) {
        self.identities.extend(
            records
                .into_iter()
                .map(|record| (record.repository.clone(), record.pr_number)),
        );
    }
}

pub fn compute_batch_id(organization: &str, collected_at: DateTime<Utc>, salt: u32) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(organization.as_bytes());
    hasher.update(b":");
    hasher.update(
        collected_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| collected_at.timestamp_millis())
            .to_string()
            .as_bytes(),
    );
    hasher.update(b":");
    hasher.update(salt.to_string().as_bytes());
    let hex = hasher.finalize().to_hex();
    hex[..16].to_owned()
}

pub fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 3_600_000.0
}

fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
