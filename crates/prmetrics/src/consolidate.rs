use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prmetrics_core::Organization;
use prmetrics_store::{
    BatchCatalog, ConsolidationOptions, ConsolidationSummary, Consolidator, RetentionPolicy,
};

use crate::cli::ConsolidateArgs;
use crate::workspace::{Workspace, organization};
use crate::write_json_to_stdout;

pub fn run_consolidate_command(workspace: &Path, args: ConsolidateArgs) -> Result<()> {
    let workspace = Workspace::open(workspace)?;
    let organization = organization(args.org.org.as_deref())?;
    let summary = consolidate(&workspace, &organization, &args, Utc::now())?;
    write_json_to_stdout(&summary)
}

/// Flags override `[retention]`; with neither set, partitions are only compacted.
pub fn retention_policy(workspace: &Workspace, args: &ConsolidateArgs) -> RetentionPolicy {
    let configured = workspace.config.retention;
    RetentionPolicy {
        keep_batches: args.keep_batches.or(configured.keep_batches),
        max_age_days: args.max_age_days.or(configured.max_age_days),
    }
}

pub fn consolidate(
    workspace: &Workspace,
    organization: &Organization,
    args: &ConsolidateArgs,
    now: DateTime<Utc>,
) -> Result<ConsolidationSummary> {
    let catalog =
        BatchCatalog::open(workspace.data_dir()).context("failed to open batch catalog")?;
    let options = ConsolidationOptions {
        organization: organization.as_str().to_owned(),
        retention: retention_policy(workspace, args),
        dry_run: args.dry_run,
        now,
    };

    let summary = Consolidator::new(workspace.layout(), workspace.lock_timeout())
        .run(&catalog, &options)
        .context("consolidation failed")?;
    if !summary.aborted.is_empty() {
        tracing::warn!(
            aborted = summary.aborted.len(),
            "some partitions were left untouched; their original files remain authoritative"
        );
    }
    Ok(summary)
}
