use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use prmetrics_core::{OptionalColumn, PullRequestRecord};
use serde::Serialize;

use crate::view::{self, DataCompleteness, MetricsView};
use crate::{mean, percent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopContributor {
    pub author: String,
    pub prs: usize,
    pub merged: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositorySummary {
    pub repository: String,
    pub prs: usize,
    pub merged: usize,
    pub contributors: usize,
    pub merge_rate_percent: Option<f64>,
    pub avg_pr_size: Option<f64>,
    pub avg_time_to_merge_hours: Option<f64>,
    pub self_merge_rate_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSummary {
    pub organization: String,
    pub repository: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_prs: usize,
    pub merged_prs: usize,
    pub merge_rate_percent: Option<f64>,
    /// PRs per day across the span of creation dates in scope.
    pub daily_throughput: Option<f64>,
    pub avg_time_to_merge_hours: Option<f64>,
    pub avg_time_to_first_review_hours: Option<f64>,
    pub avg_pr_size: Option<f64>,
    pub unique_repositories: usize,
    pub unique_authors: usize,
    pub top_contributors: Vec<TopContributor>,
    pub repository_summaries: Vec<RepositorySummary>,
    pub completeness: DataCompleteness,
}

/// Aggregate numbers for the scope; organization-wide or one repository,
/// depending on the scope's filter.
pub fn summarize(view: &MetricsView, top_contributors: usize) -> ScopeSummary {
    let completeness = view.completeness(
        "summary",
        &[OptionalColumn::MergedBy, OptionalColumn::TimeToFirstReviewHours],
    );
    let records = view.records();
    let scope = view.scope();

    let mut by_author = BTreeMap::<&str, TopContributor>::new();
    for record in records {
        let entry = by_author
            .entry(record.author.as_str())
            .or_insert_with(|| TopContributor {
                author: record.author.clone(),
                prs: 0,
                merged: 0,
            });
        entry.prs += 1;
        entry.merged += usize::from(record.is_merged());
    }
    let unique_authors = by_author.len();
    let mut top = by_author.into_values().collect::<Vec<_>>();
    top.sort_by(|left, right| {
        right
            .prs
            .cmp(&left.prs)
            .then_with(|| right.merged.cmp(&left.merged))
            .then_with(|| left.author.cmp(&right.author))
    });
    top.truncate(top_contributors);

    let repository_summaries = repository_summaries(records);
    let merged_prs = records.iter().filter(|record| record.is_merged()).count();

    ScopeSummary {
        organization: scope.organization.clone(),
        repository: scope.repository.clone(),
        window_start: scope.window_start(),
        window_end: scope.now,
        total_prs: records.len(),
        merged_prs,
        merge_rate_percent: percent(merged_prs, records.len()),
        daily_throughput: daily_throughput(records),
        avg_time_to_merge_hours: mean(
            records
                .iter()
                .filter_map(PullRequestRecord::time_to_merge_hours),
        ),
        avg_time_to_first_review_hours: mean(
            records
                .iter()
                .filter_map(view::time_to_first_review_hours),
        ),
        avg_pr_size: mean(records.iter().map(|record| record.size() as f64)),
        unique_repositories: repository_summaries.len(),
        unique_authors,
        top_contributors: top,
        repository_summaries,
        completeness,
    }
}

/// One entry per repository, busiest first.
pub fn repository_summaries(records: &[PullRequestRecord]) -> Vec<RepositorySummary> {
    let mut grouped = BTreeMap::<&str, Vec<&PullRequestRecord>>::new();
    for record in records {
        grouped.entry(record.repository.as_str()).or_default().push(record);
    }

    let mut summaries = grouped
        .into_iter()
        .map(|(repository, records)| {
            let merged = records.iter().filter(|record| record.is_merged()).count();
            let self_merged = records
                .iter()
                .filter(|record| view::self_merged(record) == Some(true))
                .count();
            RepositorySummary {
                repository: repository.to_owned(),
                prs: records.len(),
                merged,
                contributors: records
                    .iter()
                    .map(|record| record.author.as_str())
                    .collect::<BTreeSet<_>>()
                    .len(),
                merge_rate_percent: percent(merged, records.len()),
                avg_pr_size: mean(records.iter().map(|record| record.size() as f64)),
                avg_time_to_merge_hours: mean(
                    records.iter().filter_map(|record| record.time_to_merge_hours()),
                ),
                self_merge_rate_percent: percent(self_merged, merged),
            }
        })
        .collect::<Vec<_>>();
    summaries.sort_by(|left, right| {
        right
            .prs
            .cmp(&left.prs)
            .then_with(|| left.repository.cmp(&right.repository))
    });
    summaries
}

fn daily_throughput(records: &[PullRequestRecord]) -> Option<f64> {
    let created = records.iter().filter_map(|record| record.created_at);
    let (first, last) = created.fold(None, |span: Option<(DateTime<Utc>, DateTime<Utc>)>, at| {
        Some(match span {
            Some((first, last)) => (first.min(at), last.max(at)),
            None => (at, at),
        })
    })?;
    let days = (last.date_naive() - first.date_naive()).num_days() + 1;
    Some(crate::round1(records.len() as f64 / days as f64))
}
