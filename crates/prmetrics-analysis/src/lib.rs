use std::path::Path;

use chrono::{DateTime, Utc};
use prmetrics_config::{ConfigError, PrMetricsConfig, load_workspace_config};
use prmetrics_store::{RecordSource, StoreError};
use serde::Serialize;
use thiserror::Error;

mod distribution;
mod health;
mod ranking;
mod summary;
mod trends;
mod view;

pub use distribution::{
    MonthlyActivity, SizeBucketStats, SizeDistribution, monthly_activity, size_distribution,
};
pub use health::{BusFactor, HealthIndicators, RiskLevel, bus_factor, health_indicators};
pub use ranking::{
    ContributorRank, ContributorRanking, Ranking, VsOrg, contributor_ranking, ranking,
};
pub use summary::{
    RepositorySummary, ScopeSummary, TopContributor, repository_summaries, summarize,
};
pub use trends::{
    ContributorTrend, ContributorWeek, IsoWeek, Trend, WeeklyMerges, WeeklyTrends, weekly_trends,
};
pub use view::{
    DataCompleteness, MetricsView, NeutralDefault, QueryScope, ViewStats, neutral_default,
};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Every query kind evaluated over one scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub scope: QueryScope,
    pub generated_at: DateTime<Utc>,
    pub summary: ScopeSummary,
    pub ranking: Ranking,
    pub health: HealthIndicators,
    pub weekly: WeeklyTrends,
    pub sizes: SizeDistribution,
    pub monthly: Vec<MonthlyActivity>,
    pub data: ViewStats,
    pub completeness: DataCompleteness,
}

impl MetricsReport {
    pub fn to_json_pretty(&self) -> Result<String, AnalysisError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct MetricsAnalyzer {
    config: PrMetricsConfig,
}

impl MetricsAnalyzer {
    pub fn new(config: PrMetricsConfig) -> Self {
        Self { config }
    }

    pub fn from_workspace(workspace: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        Ok(Self::new(load_workspace_config(workspace)?))
    }

    pub fn config(&self) -> &PrMetricsConfig {
        &self.config
    }

    pub fn load_view<S>(&self, source: &S, scope: QueryScope) -> Result<MetricsView, AnalysisError>
    where
        S: RecordSource + ?Sized,
    {
        MetricsView::load(source, scope)
    }

    pub fn report<S>(&self, source: &S, scope: QueryScope) -> Result<MetricsReport, AnalysisError>
    where
        S: RecordSource + ?Sized,
    {
        let view = self.load_view(source, scope)?;
        Ok(self.report_view(&view))
    }

    pub fn report_view(&self, view: &MetricsView) -> MetricsReport {
        let query = &self.config.query;
        let summary = summarize(view, query.top_contributors);
        let ranking = ranking(view, query.trend_epsilon);
        let health = health_indicators(view, &self.config.health);

        let mut completeness = summary.completeness.clone();
        completeness.merge(match &ranking {
            Ranking::Repositories { completeness, .. } => completeness,
            Ranking::Contributors(contributors) => &contributors.completeness,
        });
        completeness.merge(&health.completeness);

        if view.is_empty() {
            tracing::info!(
                organization = %view.scope().organization,
                repository = ?view.scope().repository,
                "no pull requests in scope"
            );
        }

        MetricsReport {
            scope: view.scope().clone(),
            generated_at: Utc::now(),
            weekly: weekly_trends(view, query.top_contributors, query.trend_epsilon),
            sizes: size_distribution(view, &self.config.sizes),
            monthly: monthly_activity(view),
            data: view.stats().clone(),
            summary,
            ranking,
            health,
            completeness,
        }
    }
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `100 * part / whole`, or `None` when there is nothing to divide by.
pub(crate) fn percent(part: usize, whole: usize) -> Option<f64> {
    (whole > 0).then(|| round1(100.0 * part as f64 / whole as f64))
}

pub(crate) fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| round1(sum / count as f64))
}
