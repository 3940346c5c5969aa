pub mod cli;
pub mod consolidate;
pub mod ingest;
pub mod report;
pub mod status;
pub mod workspace;

use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

pub(crate) fn write_json_to_stdout(value: &impl Serialize) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).context("failed to serialize JSON output")?;
    writeln!(&mut out).context("failed to write trailing newline")?;
    Ok(())
}
