use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prmetrics_analysis::{MetricsAnalyzer, MetricsReport, QueryScope};
use prmetrics_core::Organization;

use crate::cli::ReportArgs;
use crate::workspace::{Workspace, organization};
use crate::write_json_to_stdout;

pub fn run_report_command(workspace: &Path, args: ReportArgs) -> Result<()> {
    let workspace = Workspace::open(workspace)?;
    let organization = organization(args.org.org.as_deref())?;
    let report = build_report(&workspace, &organization, &args, Utc::now())?;
    write_json_to_stdout(&report)
}

/// Command-line overrides win over the `[query]` section.
pub fn build_report(
    workspace: &Workspace,
    organization: &Organization,
    args: &ReportArgs,
    now: DateTime<Utc>,
) -> Result<MetricsReport> {
    let mut config = workspace.config.clone();
    if let Some(days) = args.days {
        config.query.day_window = days;
    }
    if let Some(min_prs) = args.min_prs {
        config.query.min_prs = min_prs;
    }
    if let Some(top_n) = args.top_n {
        config.query.top_contributors = top_n;
    }

    let scope =
        QueryScope::new(organization, &config.query, now).with_repository(args.repo.as_deref());
    let analyzer = MetricsAnalyzer::new(config);
    analyzer
        .report(&workspace.store(), scope)
        .context("metrics report failed")
}
