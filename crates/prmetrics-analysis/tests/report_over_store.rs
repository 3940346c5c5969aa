use std::collections::BTreeSet;
use std::error::Error;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use prmetrics_analysis::{MetricsAnalyzer, QueryScope, Ranking, RiskLevel};
use prmetrics_config::PrMetricsConfig;
use prmetrics_core::{CollectionBatch, Observed, Organization, PullRequestRecord};
use prmetrics_store::{BatchCatalog, BatchStatus, MetricsStore, PartitionLayout, PartitionWriter};
use tempfile::tempdir;

const LOCK_TIMEOUT: Duration = Duration::from_millis(200);

fn at(day: u32, hour: u32) -> Result<DateTime<Utc>, Box<dyn Error>> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0)
        .single()
        .ok_or_else(|| "invalid timestamp".into())
}

fn merged_pr(
    repository: &str,
    pr_number: u64,
    author: &str,
    merged_by: &str,
    created_at: DateTime<Utc>,
) -> PullRequestRecord {
    PullRequestRecord {
        organization: "acme".to_owned(),
        repository: repository.to_owned(),
        pr_number,
        author: author.to_owned(),
        created_at: Some(created_at),
        merged_at: Some(created_at + chrono::Duration::hours(4)),
        closed_at: Some(created_at + chrono::Duration::hours(4)),
        additions: 40,
        deletions: 20,
        is_draft: false,
        changed_files: Observed::Present(3),
        review_decision: Observed::Absent,
        reviews_count: Observed::Present(1),
        reviewers: Observed::Present(BTreeSet::from(["carol".to_owned()])),
        merged_by: Observed::Present(Some(merged_by.to_owned())),
        comments_count: Observed::Present(0),
        commits_count: Observed::Present(1),
        time_to_first_review_hours: Observed::Present(Some(1.0)),
        labels: Observed::Present(BTreeSet::new()),
        updated_at: Observed::Present(Some(created_at + chrono::Duration::hours(4))),
    }
}

fn ingest(
    data_dir: &std::path::Path,
    collected_at: DateTime<Utc>,
    records: &[PullRequestRecord],
) -> Result<(), Box<dyn Error>> {
    let org = Organization::new("acme").ok_or("organization")?;
    let writer = PartitionWriter::new(PartitionLayout::new(data_dir), LOCK_TIMEOUT);
    let catalog = BatchCatalog::open(data_dir)?;
    let mut batch = CollectionBatch::new(&org, 14, collected_at);
    batch.record_identities(records);
    let report = writer.write_batch(&batch, records);
    assert!(report.is_complete());
    catalog.record_batch(&batch, BatchStatus::Complete, report.files.len())?;
    Ok(())
}

fn analyzer() -> MetricsAnalyzer {
    let mut config = PrMetricsConfig::default();
    config.query.min_prs = 1;
    MetricsAnalyzer::new(config)
}

#[test]
fn recollected_merge_attribution_wins_in_report() -> Result<(), Box<dyn Error>> {
    let temp = tempdir()?;
    let data_dir = temp.path().join("data");

    ingest(
        &data_dir,
        at(10, 0)?,
        &[merged_pr("api", 1, "alice", "alice", at(5, 9)?)],
    )?;
    let mut recollected = merged_pr("api", 1, "alice", "bob", at(5, 9)?);
    recollected.updated_at = Observed::Present(Some(at(11, 0)?));
    ingest(&data_dir, at(12, 0)?, &[recollected])?;

    let store = MetricsStore::open(&data_dir, temp.path().join("legacy"));
    let analyzer = analyzer();
    let scope = QueryScope::new(
        &Organization::new("acme").ok_or("organization")?,
        &analyzer.config().query,
        at(14, 0)?,
    );
    let report = analyzer.report(&store, scope)?;

    assert_eq!(report.data.files_read, 2);
    assert_eq!(report.data.duplicates_removed, 1);
    assert_eq!(report.summary.total_prs, 1);
    assert_eq!(report.summary.merged_prs, 1);
    assert_eq!(report.health.self_merge_rate_percent, Some(0.0));
    assert!(!report.completeness.partial);
    Ok(())
}

#[test]
fn files_without_reviewers_produce_partial_contributor_ranking() -> Result<(), Box<dyn Error>> {
    let temp = tempdir()?;
    let data_dir = temp.path().join("data");

    let mut old_shape = merged_pr("api", 1, "alice", "alice", at(3, 9)?);
    old_shape.reviewers = Observed::Absent;
    ingest(&data_dir, at(4, 0)?, &[old_shape])?;
    ingest(
        &data_dir,
        at(8, 0)?,
        &[
            merged_pr("api", 2, "bob", "alice", at(6, 9)?),
            merged_pr("web", 1, "dave", "dave", at(7, 9)?),
        ],
    )?;

    let store = MetricsStore::open(&data_dir, temp.path().join("legacy"));
    let analyzer = analyzer();
    let org = Organization::new("acme").ok_or("organization")?;

    let repo_scope =
        QueryScope::new(&org, &analyzer.config().query, at(14, 0)?).with_repository(Some("api"));
    let report = analyzer.report(&store, repo_scope)?;
    let Ranking::Contributors(ranking) = &report.ranking else {
        return Err("expected contributor ranking".into());
    };
    assert!(ranking.completeness.partial);
    assert_eq!(ranking.completeness.missing_columns, vec!["reviewers".to_owned()]);
    assert_eq!(ranking.contributors.len(), 2);
    assert!(report.completeness.partial);
    let json = report.to_json_pretty()?;
    assert!(json.contains("\"mode\": \"contributors\""));

    let org_scope = QueryScope::new(&org, &analyzer.config().query, at(14, 0)?);
    let report = analyzer.report(&store, org_scope)?;
    assert!(matches!(report.ranking, Ranking::Repositories { .. }));
    assert_eq!(report.summary.unique_repositories, 2);
    assert_eq!(report.health.contributor_count, 3);
    assert_eq!(report.health.bus_factor_risk_level, Some(RiskLevel::Low));
    Ok(())
}

#[test]
fn empty_store_reports_nulls() -> Result<(), Box<dyn Error>> {
    let temp = tempdir()?;
    let store = MetricsStore::open(temp.path().join("data"), temp.path().join("legacy"));
    let analyzer = analyzer();
    let scope = QueryScope::new(
        &Organization::new("acme").ok_or("organization")?,
        &analyzer.config().query,
        at(14, 0)?,
    );

    let report = analyzer.report(&store, scope)?;
    assert_eq!(report.summary.total_prs, 0);
    assert_eq!(report.summary.merge_rate_percent, None);
    assert_eq!(report.health.bus_factor_percent, None);
    assert!(report.monthly.is_empty());
    Ok(())
}
