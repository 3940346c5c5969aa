use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{Observed, Organization, PullRequestRecord, ReviewDecision, hours_between};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("raw record is not a JSON object")]
    NotAnObject,
    #[error("missing or invalid required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid timestamp in `{field}`: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("mergedAt {merged_at} precedes createdAt {created_at}")]
    MergedBeforeCreated {
        created_at: DateTime<Utc>,
        merged_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub repository: String,
    pub pr_number: Option<u64>,
    pub error: NormalizationError,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizationReport {
    pub records: Vec<PullRequestRecord>,
    pub rejected: Vec<RejectedRecord>,
}

impl NormalizationReport {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeBucket {
    Small,
    Medium,
    Large,
    Xl,
}

impl SizeBucket {
    pub const ALL: [Self; 4] = [Self::Small, Self::Medium, Self::Large, Self::Xl];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Xl => "xl",
        }
    }
}

/// Exclusive upper bounds, in changed lines, for the small/medium/large buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeThresholds {
    pub small: u64,
    pub medium: u64,
    pub large: u64,
}

impl Default for SizeThresholds {
    fn default() -> Self {
        Self {
            small: 50,
            medium: 300,
            large: 1000,
        }
    }
}

pub fn size_bucket(lines_changed: u64, thresholds: &SizeThresholds) -> SizeBucket {
    if lines_changed < thresholds.small {
        SizeBucket::Small
    } else if lines_changed < thresholds.medium {
        SizeBucket::Medium
    } else if lines_changed < thresholds.large {
        SizeBucket::Large
    } else {
        SizeBucket::Xl
    }
}

pub fn normalize_record(
    raw: &Value,
    organization: &Organization,
    repository: &str,
) -> Result<PullRequestRecord, NormalizationError> {
    let object = raw.as_object().ok_or(NormalizationError::NotAnObject)?;

    let pr_number = object
        .get("number")
        .and_then(positive_integer)
        .ok_or(NormalizationError::MissingField("number"))?;
    let author = object
        .get("author")
        .and_then(login_of)
        .ok_or(NormalizationError::MissingField("author"))?;

    let created_at = timestamp_field(object.get("createdAt"), "createdAt")?;
    let merged_at = timestamp_field(object.get("mergedAt"), "mergedAt")?;
    let mut closed_at = timestamp_field(object.get("closedAt"), "closedAt")?;

    if let (Some(created_at), Some(merged_at)) = (created_at, merged_at) {
        if merged_at < created_at {
            return Err(NormalizationError::MergedBeforeCreated {
                created_at,
                merged_at,
            });
        }
    }
    if closed_at.is_none() {
        closed_at = merged_at;
    }

    let updated_at = match object.get("updatedAt") {
        Some(value) => Observed::Present(timestamp_field(Some(value), "updatedAt")?),
        None => Observed::Absent,
    };

    let (reviews_count, reviewers, time_to_first_review_hours) = match object.get("reviews") {
        Some(reviews) => {
            let summary = summarize_reviews(reviews, &author, created_at)?;
            (
                Observed::Present(summary.count),
                Observed::Present(summary.reviewers),
                Observed::Present(summary.time_to_first_review_hours),
            )
        }
        None => (Observed::Absent, Observed::Absent, Observed::Absent),
    };

    let merged_by = match object.get("mergedBy") {
        Some(value) => Observed::Present(login_of(value)),
        None => Observed::Absent,
    };

    Ok(PullRequestRecord {
        organization: organization.as_str().to_owned(),
        repository: repository.trim().to_owned(),
        pr_number,
        author,
        created_at,
        merged_at,
        closed_at,
        additions: object.get("additions").and_then(count_of).unwrap_or(0),
        deletions: object.get("deletions").and_then(count_of).unwrap_or(0),
        is_draft: object
            .get("isDraft")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        changed_files: object
            .get("changedFiles")
            .map(|value| count_of(value).unwrap_or(0))
            .into(),
        review_decision: object
            .get("reviewDecision")
            .map(|value| {
                value
                    .as_str()
                    .map(ReviewDecision::parse)
                    .unwrap_or(ReviewDecision::NoDecision)
            })
            .into(),
        reviews_count,
        reviewers,
        merged_by,
        comments_count: object
            .get("comments")
            .map(|value| clamp_u32(count_of(value).unwrap_or(0)))
            .into(),
        commits_count: object
            .get("commits")
            .map(|value| clamp_u32(count_of(value).unwrap_or(0)))
            .into(),
        time_to_first_review_hours,
        labels: object.get("labels").map(label_names).into(),
        updated_at,
    })
}

/// Normalizes `(repository, raw record)` pairs, keeping every rejection with its cause.
pub fn normalize_batch<'a>(
    organization: &Organization,
    items: impl IntoIterator<Item = (&'a str, &'a Value)>,
) -> NormalizationReport {
    let mut report = NormalizationReport::default();
    for (repository, raw) in items {
        match normalize_record(raw, organization, repository) {
            Ok(record) => report.records.push(record),
            Err(error) => report.rejected.push(RejectedRecord {
                repository: repository.to_owned(),
                pr_number: raw.get("number").and_then(positive_integer),
                error,
            }),
        }
    }
    report
}

struct ReviewSummary {
    count: u32,
    reviewers: BTreeSet<String>,
    time_to_first_review_hours: Option<f64>,
}

fn summarize_reviews(
    reviews: &Value,
    author: &str,
    created_at: Option<DateTime<Utc>>,
) -> Result<ReviewSummary, NormalizationError> {
    let items = match reviews {
        Value::Array(items) => items.as_slice(),
        Value::Object(object) => object
            .get("nodes")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };

    let mut reviewers = BTreeSet::new();
    let mut earliest = None::<DateTime<Utc>>;
    for review in items {
        if let Some(login) = review.get("author").and_then(login_of) {
            if login != author {
                reviewers.insert(login);
            }
        }
        if let Some(submitted_at) = timestamp_field(review.get("submittedAt"), "submittedAt")? {
            earliest = Some(match earliest {
                Some(current) if current <= submitted_at => current,
                _ => submitted_at,
            });
        }
    }

    let time_to_first_review_hours = match (created_at, earliest) {
        (Some(created_at), Some(first_review)) => {
            Some(hours_between(created_at, first_review).max(0.0))
        }
        _ => None,
    };

    Ok(ReviewSummary {
        count: clamp_u32(items.len() as u64),
        reviewers,
        time_to_first_review_hours,
    })
}

fn timestamp_field(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, NormalizationError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::String(raw) if raw.trim().is_empty() => Ok(None),
        Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| NormalizationError::InvalidTimestamp {
                field,
                value: raw.clone(),
            }),
        other => Err(NormalizationError::InvalidTimestamp {
            field,
            value: other.to_string(),
        }),
    }
}

fn login_of(value: &Value) -> Option<String> {
    let login = match value {
        Value::String(login) => login.as_str(),
        Value::Object(object) => object.get("login").and_then(Value::as_str)?,
        _ => return None,
    };
    let login = login.trim();
    (!login.is_empty()).then(|| login.to_owned())
}

fn positive_integer(value: &Value) -> Option<u64> {
    let number = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (number > 0).then_some(number)
}

fn count_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
        Value::Array(items) => Some(items.len() as u64),
        Value::Object(object) => object.get("totalCount").and_then(count_of),
        _ => None,
    }
}

fn label_names(value: &Value) -> BTreeSet<String> {
    let Some(items) = value.as_array() else {
        return BTreeSet::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(name) => Some(name.as_str()),
            Value::Object(object) => object.get("name").and_then(Value::as_str),
            _ => None,
        })
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::OptionalColumn;

    fn org() -> Organization {
        Organization::new("Acme").expect("org")
    }

    #[test]
    fn normalizes_full_record_with_reviews_and_merge() {
        let raw = json!({
            "number": 7,
            "author": {"login": "alice"},
            "createdAt": "2025-01-01T00:00:00Z",
            "mergedAt": "2025-01-02T00:00:00Z",
            "closedAt": "2025-01-02T00:00:00Z",
            "additions": 40,
            "deletions": 20,
            "isDraft": false,
            "reviewDecision": "APPROVED",
            "mergedBy": {"login": "alice"},
            "comments": [{"body": "lgtm"}, {"body": "nit"}],
            "commits": {"totalCount": 3},
            "changedFiles": 4,
            "labels": [{"name": "bug"}, {"name": " "}],
            "reviews": [
                {"author": {"login": "bob"}, "submittedAt": "2025-01-01T06:00:00Z"},
                {"author": {"login": "carol"}, "submittedAt": "2025-01-01T03:00:00Z"},
                {"author": {"login": "alice"}, "submittedAt": "2025-01-01T09:00:00Z"}
            ]
        });

        let record = normalize_record(&raw, &org(), "svc").expect("normalize");
        assert_eq!(record.organization, "acme");
        assert_eq!(record.pr_number, 7);
        assert_eq!(record.author, "alice");
        assert_eq!(record.reviews_count, Observed::Present(3));
        assert_eq!(
            record.reviewers.present().map(|set| set.len()),
            Some(2),
            "author's own review is not counted as a reviewer"
        );
        assert_eq!(record.time_to_first_review_hours, Observed::Present(Some(3.0)));
        assert_eq!(record.self_merged(), Observed::Present(Some(true)));
        assert_eq!(record.comments_count, Observed::Present(2));
        assert_eq!(record.commits_count, Observed::Present(3));
        assert_eq!(record.changed_files, Observed::Present(4));
        assert_eq!(
            record.review_decision,
            Observed::Present(ReviewDecision::Approved)
        );
        assert_eq!(
            record.labels.present().map(|labels| labels.len()),
            Some(1)
        );
    }

    #[test]
    fn missing_optional_keys_become_absent_columns() {
        let raw = json!({
            "number": 3,
            "author": "dave",
            "createdAt": "2025-02-01T10:00:00Z"
        });

        let record = normalize_record(&raw, &org(), "svc").expect("normalize");
        assert!(record.observed_columns().is_empty());
        assert_eq!(record.self_merged(), Observed::Absent);
        assert_eq!(record.additions, 0);
    }

    #[test]
    fn empty_reviews_yield_null_time_to_first_review() {
        let raw = json!({
            "number": 3,
            "author": "dave",
            "createdAt": "2025-02-01T10:00:00Z",
            "reviews": []
        });

        let record = normalize_record(&raw, &org(), "svc").expect("normalize");
        assert_eq!(record.time_to_first_review_hours, Observed::Present(None));
        assert_eq!(record.reviews_count, Observed::Present(0));
        assert!(record.observed_columns().contains(&OptionalColumn::Reviewers));
    }

    #[test]
    fn unmerged_pr_has_null_self_merged() {
        let raw = json!({
            "number": 9,
            "author": {"login": "erin"},
            "createdAt": "2025-02-01T10:00:00Z",
            "mergedAt": null,
            "mergedBy": null
        });

        let record = normalize_record(&raw, &org(), "svc").expect("normalize");
        assert_eq!(record.merged_by, Observed::Present(None));
        assert_eq!(record.self_merged(), Observed::Present(None));
    }

    #[test]
    fn rejects_records_without_identity_fields() {
        let no_number = json!({"author": {"login": "x"}});
        assert_eq!(
            normalize_record(&no_number, &org(), "svc"),
            Err(NormalizationError::MissingField("number"))
        );

        let no_author = json!({"number": 4, "author": null});
        assert_eq!(
            normalize_record(&no_author, &org(), "svc"),
            Err(NormalizationError::MissingField("author"))
        );

        assert_eq!(
            normalize_record(&json!([1, 2]), &org(), "svc"),
            Err(NormalizationError::NotAnObject)
        );
    }

    #[test]
    fn rejects_merge_before_creation_and_fills_closed_at() {
        let backwards = json!({
            "number": 5,
            "author": "x",
            "createdAt": "2025-01-02T00:00:00Z",
            "mergedAt": "2025-01-01T00:00:00Z"
        });
        assert!(matches!(
            normalize_record(&backwards, &org(), "svc"),
            Err(NormalizationError::MergedBeforeCreated { .. })
        ));

        let unclosed = json!({
            "number": 6,
            "author": "x",
            "createdAt": "2025-01-01T00:00:00Z",
            "mergedAt": "2025-01-03T00:00:00Z"
        });
        let record = normalize_record(&unclosed, &org(), "svc").expect("normalize");
        assert_eq!(record.closed_at, record.merged_at);
    }

    #[test]
    fn batch_normalization_counts_rejections() {
        let good = json!({"number": 1, "author": "a"});
        let bad = json!({"number": 2});
        let worse = json!({"author": "b", "createdAt": "yesterday"});

        let report = normalize_batch(&org(), [("svc", &good), ("svc", &bad), ("api", &worse)]);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.rejected_count(), 2);
        assert_eq!(report.rejected[0].pr_number, Some(2));
        assert_eq!(report.rejected[1].repository, "api");
    }

    #[test]
    fn size_buckets_use_exclusive_upper_bounds() {
        let thresholds = SizeThresholds::default();
        assert_eq!(size_bucket(0, &thresholds), SizeBucket::Small);
        assert_eq!(size_bucket(49, &thresholds), SizeBucket::Small);
        assert_eq!(size_bucket(50, &thresholds), SizeBucket::Medium);
        assert_eq!(size_bucket(299, &thresholds), SizeBucket::Medium);
        assert_eq!(size_bucket(999, &thresholds), SizeBucket::Large);
        assert_eq!(size_bucket(1000, &thresholds), SizeBucket::Xl);

        let tight = SizeThresholds {
            small: 10,
            medium: 20,
            large: 30,
        };
        assert_eq!(size_bucket(25, &tight), SizeBucket::Large);
    }
}
