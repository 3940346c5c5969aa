use std::collections::BTreeMap;

use prmetrics_core::{OptionalColumn, PullRequestRecord};
use serde::Serialize;

use crate::summary::{RepositorySummary, repository_summaries};
use crate::view::{self, DataCompleteness, MetricsView};
use crate::{mean, percent};

/// A contributor's merge rate relative to the whole scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VsOrg {
    Above,
    Below,
    OnPar,
}

impl VsOrg {
    pub fn compare(rate: Option<f64>, baseline: Option<f64>, epsilon: f64) -> Option<Self> {
        let delta = rate? - baseline?;
        Some(if delta > epsilon {
            Self::Above
        } else if delta < -epsilon {
            Self::Below
        } else {
            Self::OnPar
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributorRank {
    pub author: String,
    pub prs: usize,
    pub merged: usize,
    pub merge_rate_percent: Option<f64>,
    pub avg_merge_time_hours: Option<f64>,
    pub avg_pr_size: Option<f64>,
    pub avg_reviews: Option<f64>,
    /// PRs in scope, by anyone else, that this contributor reviewed.
    pub reviews_given: usize,
    pub self_merge_rate_percent: Option<f64>,
    pub vs_org_indicator: Option<VsOrg>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributorRanking {
    pub baseline_merge_rate_percent: Option<f64>,
    pub contributors: Vec<ContributorRank>,
    pub completeness: DataCompleteness,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Ranking {
    Repositories {
        repositories: Vec<RepositorySummary>,
        completeness: DataCompleteness,
    },
    Contributors(ContributorRanking),
}

/// Repositories for an organization-wide scope, contributors once a repository is chosen.
pub fn ranking(view: &MetricsView, trend_epsilon: f64) -> Ranking {
    if view.scope().repository.is_some() {
        return Ranking::Contributors(contributor_ranking(view, trend_epsilon));
    }
    Ranking::Repositories {
        completeness: view.completeness("repository_ranking", &[OptionalColumn::MergedBy]),
        repositories: repository_summaries(view.records()),
    }
}

pub fn contributor_ranking(view: &MetricsView, trend_epsilon: f64) -> ContributorRanking {
    let completeness = view.completeness(
        "contributor_ranking",
        &[
            OptionalColumn::Reviewers,
            OptionalColumn::ReviewsCount,
            OptionalColumn::MergedBy,
        ],
    );
    let records = view.records();
    let baseline = percent(
        records.iter().filter(|record| record.is_merged()).count(),
        records.len(),
    );

    let mut given = BTreeMap::<&str, usize>::new();
    for record in records {
        for reviewer in view::reviewers(record) {
            if reviewer != &record.author {
                *given.entry(reviewer.as_str()).or_default() += 1;
            }
        }
    }

    let mut by_author = BTreeMap::<&str, Vec<&PullRequestRecord>>::new();
    for record in records {
        by_author.entry(record.author.as_str()).or_default().push(record);
    }

    let mut contributors = by_author
        .into_iter()
        .map(|(author, authored)| {
            let merged = authored.iter().filter(|record| record.is_merged()).count();
            let self_merged = authored
                .iter()
                .filter(|record| view::self_merged(record) == Some(true))
                .count();
            let merge_rate_percent = percent(merged, authored.len());
            ContributorRank {
                author: author.to_owned(),
                prs: authored.len(),
                merged,
                merge_rate_percent,
                avg_merge_time_hours: mean(
                    authored.iter().filter_map(|record| record.time_to_merge_hours()),
                ),
                avg_pr_size: mean(authored.iter().map(|record| record.size() as f64)),
                avg_reviews: mean(
                    authored
                        .iter()
                        .map(|record| f64::from(view::reviews_count(record))),
                ),
                reviews_given: given.get(author).copied().unwrap_or(0),
                self_merge_rate_percent: percent(self_merged, merged),
                vs_org_indicator: VsOrg::compare(merge_rate_percent, baseline, trend_epsilon),
            }
        })
        .collect::<Vec<_>>();
    contributors.sort_by(|left, right| {
        right
            .prs
            .cmp(&left.prs)
            .then_with(|| right.merged.cmp(&left.merged))
            .then_with(|| left.author.cmp(&right.author))
    });

    ContributorRanking {
        baseline_merge_rate_percent: baseline,
        contributors,
        completeness,
    }
}
