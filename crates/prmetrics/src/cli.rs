use std::ffi::OsStr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[value(rename_all = "lower")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct OrgArgs {
    #[arg(long, help = "Organization to operate on (falls back to PR_METRICS_ORG)")]
    pub org: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct IngestArgs {
    #[command(flatten)]
    pub org: OrgArgs,

    #[arg(
        long = "input",
        required = true,
        value_name = "FILE",
        help = "Raw PR JSON: {\"<repo>\": [..]} or [{\"repository\": \"<repo>\", ..}]"
    )]
    pub inputs: Vec<PathBuf>,

    #[arg(long, help = "Collection window in days (defaults to query.day_window)")]
    pub days: Option<u32>,

    #[arg(
        long,
        value_parser = parse_timestamp,
        help = "Collection time as RFC 3339 (defaults to now)"
    )]
    pub collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ReportArgs {
    #[command(flatten)]
    pub org: OrgArgs,

    #[arg(long, help = "Limit the report to one repository")]
    pub repo: Option<String>,

    #[arg(long, help = "Trailing window in days")]
    pub days: Option<u32>,

    #[arg(long, help = "Minimum PRs for a repository to count organization-wide")]
    pub min_prs: Option<usize>,

    #[arg(long, help = "Number of top contributors to list")]
    pub top_n: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ConsolidateArgs {
    #[command(flatten)]
    pub org: OrgArgs,

    #[arg(long, help = "Keep only the newest N batches")]
    pub keep_batches: Option<u32>,

    #[arg(long, help = "Expire batches collected more than N days ago")]
    pub max_age_days: Option<u32>,

    #[arg(long, help = "Report the plan without touching files")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub org: OrgArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Normalize raw PR records and write them as one collection batch
    Ingest(IngestArgs),
    /// Print summary, ranking, health and trend metrics as JSON
    Report(ReportArgs),
    /// Compact partitions and drop expired batches
    Consolidate(ConsolidateArgs),
    /// List catalog batches and partition files
    Status(StatusArgs),
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Partitioned pull-request metrics store")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .prmetrics/config.toml"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = LogFormat::Human,
        help = "Log format for stderr"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC 3339 timestamp '{value}': {err}"))
}
