use anyhow::Result;
use prmetrics::cli::{Cli, Commands, LogFormat, parse_cli};
use prmetrics::consolidate::run_consolidate_command;
use prmetrics::ingest::run_ingest_command;
use prmetrics::report::run_report_command;
use prmetrics::status::run_status_command;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);
    run(cli)
}

/// Logs go to stderr so stdout carries only JSON results.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Human => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace;
    match cli.command {
        Commands::Ingest(args) => run_ingest_command(&workspace, args),
        Commands::Report(args) => run_report_command(&workspace, args),
        Commands::Consolidate(args) => run_consolidate_command(&workspace, args),
        Commands::Status(args) => run_status_command(&workspace, args),
    }
}
