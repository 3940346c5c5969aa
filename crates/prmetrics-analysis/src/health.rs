use std::collections::{BTreeMap, BTreeSet};

use prmetrics_config::HealthConfig;
use prmetrics_core::OptionalColumn;
use serde::Serialize;

use crate::view::{self, DataCompleteness, MetricsView};
use crate::{percent, round1};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    pub fn from_share(percent: f64, config: &HealthConfig) -> Self {
        if percent > config.high_percent {
            Self::High
        } else if percent >= config.moderate_percent {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusFactor {
    pub contributors: usize,
    pub top_contributors: usize,
    /// Share of PRs authored by the top contributors.
    pub percent: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIndicators {
    pub bus_factor_percent: Option<f64>,
    pub bus_factor_risk_level: Option<RiskLevel>,
    pub top_contributor_count: usize,
    pub contributor_count: usize,
    pub self_merge_rate_percent: Option<f64>,
    pub review_participation_percent: Option<f64>,
    pub completeness: DataCompleteness,
}

/// `None` when there are no PRs. Contributors are ranked by PR count and the top
/// `ceil(top_share * contributors)`, at least one, are counted.
pub fn bus_factor(pr_counts: &[usize], config: &HealthConfig) -> Option<BusFactor> {
    let total = pr_counts.iter().sum::<usize>();
    if total == 0 {
        return None;
    }
    let mut sorted = pr_counts.to_vec();
    sorted.sort_unstable_by(|left, right| right.cmp(left));

    // Tolerate 5 * 0.2 landing a hair above 1.0.
    let top = ((sorted.len() as f64 * config.top_share) - 1e-9).ceil().max(1.0) as usize;
    let top = top.min(sorted.len());
    let share = round1(100.0 * sorted[..top].iter().sum::<usize>() as f64 / total as f64);

    Some(BusFactor {
        contributors: sorted.len(),
        top_contributors: top,
        percent: share,
        risk_level: RiskLevel::from_share(share, config),
    })
}

pub fn health_indicators(view: &MetricsView, config: &HealthConfig) -> HealthIndicators {
    let completeness = view.completeness(
        "health",
        &[OptionalColumn::MergedBy, OptionalColumn::Reviewers],
    );
    let records = view.records();

    let mut per_author = BTreeMap::<&str, usize>::new();
    for record in records {
        *per_author.entry(record.author.as_str()).or_default() += 1;
    }
    let counts = per_author.values().copied().collect::<Vec<_>>();
    let bus = bus_factor(&counts, config);

    let merged = records.iter().filter(|record| record.is_merged()).count();
    let self_merged = records
        .iter()
        .filter(|record| view::self_merged(record) == Some(true))
        .count();

    let reviewers = records
        .iter()
        .flat_map(|record| {
            view::reviewers(record)
                .iter()
                .filter(move |reviewer| **reviewer != record.author)
        })
        .map(String::as_str)
        .collect::<BTreeSet<_>>();
    let participating = per_author
        .keys()
        .filter(|author| reviewers.contains(*author))
        .count();

    HealthIndicators {
        bus_factor_percent: bus.as_ref().map(|bus| bus.percent),
        bus_factor_risk_level: bus.as_ref().map(|bus| bus.risk_level),
        top_contributor_count: bus.as_ref().map_or(0, |bus| bus.top_contributors),
        contributor_count: per_author.len(),
        self_merge_rate_percent: percent(self_merged, merged),
        review_participation_percent: percent(participating, per_author.len()),
        completeness,
    }
}
