use std::collections::{BTreeMap, BTreeSet};

use chrono::Datelike;
use prmetrics_core::{PullRequestRecord, SizeBucket, SizeThresholds, size_bucket};
use serde::Serialize;

use crate::view::MetricsView;
use crate::{mean, percent};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeBucketStats {
    pub bucket: SizeBucket,
    pub count: usize,
    pub percent: Option<f64>,
    pub avg_time_to_merge_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeDistribution {
    pub thresholds: SizeThresholds,
    pub buckets: Vec<SizeBucketStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyActivity {
    pub month: String,
    pub created: usize,
    pub merged: usize,
    pub active_authors: usize,
    pub avg_pr_size: Option<f64>,
}

/// Every bucket is listed, empty ones included.
pub fn size_distribution(view: &MetricsView, thresholds: &SizeThresholds) -> SizeDistribution {
    let records = view.records();
    let mut grouped = BTreeMap::<SizeBucket, Vec<&PullRequestRecord>>::new();
    for record in records {
        grouped
            .entry(size_bucket(record.size(), thresholds))
            .or_default()
            .push(record);
    }

    let buckets = SizeBucket::ALL
        .into_iter()
        .map(|bucket| {
            let members = grouped.remove(&bucket).unwrap_or_default();
            SizeBucketStats {
                bucket,
                count: members.len(),
                percent: percent(members.len(), records.len()),
                avg_time_to_merge_hours: mean(
                    members
                        .iter()
                        .filter_map(|record| record.time_to_merge_hours()),
                ),
            }
        })
        .collect();

    SizeDistribution {
        thresholds: *thresholds,
        buckets,
    }
}

/// Grouped by the month a PR was created; `merged` counts those PRs that merged.
pub fn monthly_activity(view: &MetricsView) -> Vec<MonthlyActivity> {
    let mut grouped = BTreeMap::<(i32, u32), Vec<&PullRequestRecord>>::new();
    for record in view.records() {
        if let Some(created_at) = record.created_at {
            grouped
                .entry((created_at.year(), created_at.month()))
                .or_default()
                .push(record);
        }
    }

    grouped
        .into_iter()
        .map(|((year, month), records)| MonthlyActivity {
            month: format!("{year:04}-{month:02}"),
            created: records.len(),
            merged: records.iter().filter(|record| record.is_merged()).count(),
            active_authors: records
                .iter()
                .map(|record| record.author.as_str())
                .collect::<BTreeSet<_>>()
                .len(),
            avg_pr_size: mean(records.iter().map(|record| record.size() as f64)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use prmetrics_core::Observed;

    use super::*;
    use crate::QueryScope;

    fn at(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, month, day, 6, 0, 0)
            .single()
            .expect("timestamp")
    }

    fn pr(pr_number: u64, author: &str, month: u32, size: u64, merged: bool) -> PullRequestRecord {
        PullRequestRecord {
            organization: "acme".to_owned(),
            repository: "api".to_owned(),
            pr_number,
            author: author.to_owned(),
            created_at: Some(at(month, 10)),
            merged_at: merged.then(|| at(month, 11)),
            closed_at: merged.then(|| at(month, 11)),
            additions: size,
            deletions: 0,
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

    fn view(records: Vec<PullRequestRecord>) -> MetricsView {
        let scope = QueryScope {
            organization: "acme".to_owned(),
            repository: None,
            day_window: 120,
            min_prs: 0,
            now: at(4, 30),
        };
        MetricsView::from_records(scope, records)
    }

    #[test]
    fn buckets_use_configured_thresholds() {
        let view = view(vec![
            pr(1, "ann", 3, 10, true),
            pr(2, "ann", 3, 49, false),
            pr(3, "ben", 3, 50, true),
            pr(4, "ben", 3, 5_000, false),
        ]);

        let default = size_distribution(&view, &SizeThresholds::default());
        let counts = default
            .buckets
            .iter()
            .map(|bucket| bucket.count)
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![2, 1, 0, 1]);
        assert_eq!(default.buckets[0].percent, Some(50.0));
        assert_eq!(default.buckets[0].avg_time_to_merge_hours, Some(24.0));
        assert_eq!(default.buckets[2].avg_time_to_merge_hours, None);

        let tight = SizeThresholds {
            small: 20,
            medium: 40,
            large: 60,
        };
        let counts = size_distribution(&view, &tight)
            .buckets
            .iter()
            .map(|bucket| bucket.count)
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![1, 0, 2, 1]);
    }

    #[test]
    fn monthly_activity_groups_by_creation_month() {
        let months = monthly_activity(&view(vec![
            pr(1, "ann", 2, 10, true),
            pr(2, "ben", 2, 30, false),
            pr(3, "ann", 3, 20, true),
        ]));
        assert_eq!(months.len(), 2);
        assert_eq!(months[0].month, "2025-02");
        assert_eq!(months[0].created, 2);
        assert_eq!(months[0].merged, 1);
        assert_eq!(months[0].active_authors, 2);
        assert_eq!(months[0].avg_pr_size, Some(20.0));
        assert_eq!(months[1].month, "2025-03");
    }
}
