use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Utc};
use prmetrics_core::PullRequestRecord;
use serde::Serialize;

use crate::view::MetricsView;
use crate::{mean, percent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct IsoWeek {
    pub year: i32,
    pub week: u32,
}

impl IsoWeek {
    pub fn of(at: DateTime<Utc>) -> Self {
        let week = at.iso_week();
        Self {
            year: week.year(),
            week: week.week(),
        }
    }

    pub fn label(self) -> String {
        format!("{}-W{:02}", self.year, self.week)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

impl Trend {
    /// `delta` and `epsilon` are percentage points.
    pub fn from_delta(delta: f64, epsilon: f64) -> Self {
        if delta > epsilon {
            Self::Improving
        } else if delta < -epsilon {
            Self::Declining
        } else {
            Self::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyMerges {
    pub week: String,
    pub merged: usize,
    pub avg_time_to_merge_hours: Option<f64>,
    pub active_authors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributorWeek {
    pub week: String,
    pub created: usize,
    pub merged: usize,
    /// Share of the PRs created this week that have merged since.
    pub merge_rate_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributorTrend {
    pub author: String,
    pub weeks: Vec<ContributorWeek>,
    pub trend: Option<Trend>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyTrends {
    pub weeks: Vec<WeeklyMerges>,
    pub contributors: Vec<ContributorTrend>,
}

/// Org-level merges per ISO week plus week-over-week merge rates for the
/// `top_contributors` busiest authors.
pub fn weekly_trends(view: &MetricsView, top_contributors: usize, epsilon: f64) -> WeeklyTrends {
    let records = view.records();

    let mut merged_by_week = BTreeMap::<IsoWeek, Vec<&PullRequestRecord>>::new();
    for record in records {
        if let Some(merged_at) = record.merged_at {
            merged_by_week
                .entry(IsoWeek::of(merged_at))
                .or_default()
                .push(record);
        }
    }
    let weeks = merged_by_week
        .into_iter()
        .map(|(week, merged)| WeeklyMerges {
            week: week.label(),
            merged: merged.len(),
            avg_time_to_merge_hours: mean(
                merged.iter().filter_map(|record| record.time_to_merge_hours()),
            ),
            active_authors: merged
                .iter()
                .map(|record| record.author.as_str())
                .collect::<BTreeSet<_>>()
                .len(),
        })
        .collect();

    let mut per_author = BTreeMap::<&str, Vec<&PullRequestRecord>>::new();
    for record in records {
        per_author.entry(record.author.as_str()).or_default().push(record);
    }
    let mut busiest = per_author.into_iter().collect::<Vec<_>>();
    busiest.sort_by(|left, right| {
        right
            .1
            .len()
            .cmp(&left.1.len())
            .then_with(|| left.0.cmp(right.0))
    });
    busiest.truncate(top_contributors);

    let contributors = busiest
        .into_iter()
        .map(|(author, authored)| contributor_trend(author, &authored, epsilon))
        .collect();

    WeeklyTrends {
        weeks,
        contributors,
    }
}

fn contributor_trend(
    author: &str,
    authored: &[&PullRequestRecord],
    epsilon: f64,
) -> ContributorTrend {
    // Cohorts by creation week, so `merged <= created` in every week.
    let mut counts = BTreeMap::<IsoWeek, (usize, usize)>::new();
    for record in authored {
        let Some(created_at) = record.created_at else {
            continue;
        };
        let cohort = counts.entry(IsoWeek::of(created_at)).or_default();
        cohort.0 += 1;
        if record.merged_at.is_some() {
            cohort.1 += 1;
        }
    }

    let weeks = counts
        .into_iter()
        .map(|(week, (created, merged))| ContributorWeek {
            week: week.label(),
            created,
            merged,
            merge_rate_percent: percent(merged, created),
        })
        .collect::<Vec<_>>();

    let rated = weeks
        .iter()
        .filter_map(|week| week.merge_rate_percent)
        .collect::<Vec<_>>();
    let trend = match rated.as_slice() {
        [.., previous, latest] => Some(Trend::from_delta(latest - previous, epsilon)),
        _ => None,
    };

    ContributorTrend {
        author: author.to_owned(),
        weeks,
        trend,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use prmetrics_core::Observed;

    use super::*;
    use crate::QueryScope;

    fn at(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, month, day, 10, 0, 0)
            .single()
            .expect("timestamp")
    }

    fn pr(
        pr_number: u64,
        author: &str,
        created: DateTime<Utc>,
        merged: Option<DateTime<Utc>>,
    ) -> PullRequestRecord {
        PullRequestRecord {
            organization: "acme".to_owned(),
            repository: "api".to_owned(),
            pr_number,
            author: author.to_owned(),
            created_at: Some(created),
            merged_at: merged,
            closed_at: merged,
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

    fn view(records: Vec<PullRequestRecord>) -> MetricsView {
        let scope = QueryScope {
            organization: "acme".to_owned(),
            repository: None,
            day_window: 60,
            min_prs: 0,
            now: at(3, 1),
        };
        MetricsView::from_records(scope, records)
    }

    #[test]
    fn iso_weeks_cross_year_boundaries() {
        assert_eq!(IsoWeek::of(at(1, 1)).label(), "2025-W01");
        let dec_29_2024 = Utc
            .with_ymd_and_hms(2024, 12, 29, 12, 0, 0)
            .single()
            .expect("timestamp");
        assert_eq!(IsoWeek::of(dec_29_2024).label(), "2024-W52");
        let dec_30_2024 = Utc
            .with_ymd_and_hms(2024, 12, 30, 12, 0, 0)
            .single()
            .expect("timestamp");
        assert_eq!(IsoWeek::of(dec_30_2024).label(), "2025-W01");
    }

    #[test]
    fn weekly_merges_and_contributor_trend() {
        // 2025-02-03 and 2025-02-10 are Mondays (W06, W07).
        let records = vec![
            pr(1, "ann", at(2, 3), Some(at(2, 4))),
            pr(2, "ann", at(2, 4), Some(at(2, 5))),
            pr(3, "ann", at(2, 10), Some(at(2, 11))),
            pr(4, "ann", at(2, 11), None),
            pr(5, "ann", at(2, 12), None),
            pr(6, "ben", at(2, 3), Some(at(2, 12))),
        ];
        let trends = weekly_trends(&view(records), 1, 5.0);

        assert_eq!(trends.weeks.len(), 2);
        assert_eq!(trends.weeks[0].week, "2025-W06");
        assert_eq!(trends.weeks[0].merged, 2);
        assert_eq!(trends.weeks[1].merged, 2);
        assert_eq!(trends.weeks[1].active_authors, 2);

        assert_eq!(trends.contributors.len(), 1);
        let ann = &trends.contributors[0];
        assert_eq!(ann.author, "ann");
        assert_eq!(ann.weeks[0].merge_rate_percent, Some(100.0));
        assert_eq!(ann.weeks[1].merge_rate_percent, Some(33.3));
        assert_eq!(ann.trend, Some(Trend::Declining));
    }

    #[test]
    fn merges_count_toward_the_week_the_pr_was_created() {
        let records = vec![
            pr(1, "ann", at(2, 3), Some(at(2, 10))),
            pr(2, "ann", at(2, 4), Some(at(2, 11))),
            pr(3, "ann", at(2, 5), Some(at(2, 12))),
            pr(4, "ann", at(2, 11), None),
        ];
        let trends = weekly_trends(&view(records), 1, 5.0);

        assert_eq!(trends.weeks.len(), 1);
        assert_eq!(trends.weeks[0].week, "2025-W07");
        assert_eq!(trends.weeks[0].merged, 3);

        let ann = &trends.contributors[0];
        let weeks = ann
            .weeks
            .iter()
            .map(|week| (week.week.as_str(), week.created, week.merged))
            .collect::<Vec<_>>();
        assert_eq!(weeks, vec![("2025-W06", 3, 3), ("2025-W07", 1, 0)]);
        assert!(
            ann.weeks
                .iter()
                .filter_map(|week| week.merge_rate_percent)
                .all(|rate| rate <= 100.0)
        );
        assert_eq!(ann.weeks[0].merge_rate_percent, Some(100.0));
        assert_eq!(ann.weeks[1].merge_rate_percent, Some(0.0));
        assert_eq!(ann.trend, Some(Trend::Declining));
    }

    #[test]
    fn cohort_spanning_new_year_keeps_its_iso_week() {
        let dec = |day| {
            Utc.with_ymd_and_hms(2024, 12, day, 10, 0, 0)
                .single()
                .expect("timestamp")
        };
        let jan = |day| {
            Utc.with_ymd_and_hms(2025, 1, day, 10, 0, 0)
                .single()
                .expect("timestamp")
        };
        // Dec 23-27 2024 is 2024-W52; Jan 2 2025 is 2025-W01.
        let records = vec![
            pr(1, "ann", dec(23), Some(jan(2))),
            pr(2, "ann", dec(27), None),
            pr(3, "ann", jan(2), Some(jan(3))),
        ];
        let scope = QueryScope {
            organization: "acme".to_owned(),
            repository: None,
            day_window: 30,
            min_prs: 0,
            now: jan(10),
        };
        let trends = weekly_trends(&MetricsView::from_records(scope, records), 1, 5.0);

        let ann = &trends.contributors[0];
        assert_eq!(ann.weeks[0].week, "2024-W52");
        assert_eq!((ann.weeks[0].created, ann.weeks[0].merged), (2, 1));
        assert_eq!(ann.weeks[0].merge_rate_percent, Some(50.0));
        assert_eq!(ann.weeks[1].week, "2025-W01");
        assert_eq!((ann.weeks[1].created, ann.weeks[1].merged), (1, 1));
        assert_eq!(ann.trend, Some(Trend::Improving));

        assert_eq!(trends.weeks.len(), 1);
        assert_eq!(trends.weeks[0].week, "2025-W01");
        assert_eq!(trends.weeks[0].merged, 2);
    }

    #[test]
    fn trend_needs_two_rated_weeks() {
        let trends = weekly_trends(&view(vec![pr(1, "ann", at(2, 3), None)]), 5, 5.0);
        assert!(trends.weeks.is_empty());
        assert_eq!(trends.contributors[0].trend, None);

        assert_eq!(Trend::from_delta(5.0, 5.0), Trend::Stable);
        assert_eq!(Trend::from_delta(5.1, 5.0), Trend::Improving);
    }
}
