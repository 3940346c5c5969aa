use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use prmetrics_core::{CollectionBatch, Organization, normalize_batch};
use prmetrics_store::{BatchCatalog, BatchStatus, DeferredPartition, PartitionWriter, WrittenFile};
use serde::Serialize;
use serde_json::Value;

use crate::cli::IngestArgs;
use crate::workspace::{Workspace, organization};
use crate::write_json_to_stdout;

/// Raw records keyed by the repository they belong to.
#[derive(Debug, Default, PartialEq)]
pub struct RawInput {
    pub items: Vec<(String, Value)>,
    /// Array-shaped entries that named no repository.
    pub unassigned: usize,
}

impl RawInput {
    /// Accepts `{"<repo>": [<raw pr>, ..]}` or `[{"repository": "<repo>", ..}]`.
    pub fn parse(raw: &str, source: &Path) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .with_context(|| format!("failed to parse JSON from {}", source.display()))?;

        let mut input = Self::default();
        match value {
            Value::Object(by_repository) => {
                for (repository, records) in by_repository {
                    let Value::Array(records) = records else {
                        bail!(
                            "{}: value for repository '{repository}' is not an array",
                            source.display()
                        );
                    };
                    input
                        .items
                        .extend(records.into_iter().map(|record| (repository.clone(), record)));
                }
            }
            Value::Array(records) => {
                for record in records {
                    let repository = record
                        .get("repository")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_owned);
                    match repository {
                        Some(repository) => input.items.push((repository, record)),
                        None => input.unassigned += 1,
                    }
                }
            }
            _ => bail!(
                "{}: expected an object keyed by repository or an array of records",
                source.display()
            ),
        }
        Ok(input)
    }

    fn extend(&mut self, other: Self) {
        self.items.extend(other.items);
        self.unassigned += other.unassigned;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionEntry {
    pub repository: String,
    pub pr_number: Option<u64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub organization: String,
    pub batch_id: String,
    pub collected_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub input_records: usize,
    pub unassigned_records: usize,
    pub normalized_records: usize,
    pub rejected: Vec<RejectionEntry>,
    pub rows_written: usize,
    pub files: Vec<WrittenFile>,
    pub deferred: Vec<DeferredPartition>,
}

pub fn run_ingest_command(workspace: &Path, args: IngestArgs) -> Result<()> {
    let workspace = Workspace::open(workspace)?;
    let organization = organization(args.org.org.as_deref())?;
    let window_days = args.days.unwrap_or(workspace.config.query.day_window);
    let collected_at = args.collected_at.unwrap_or_else(Utc::now);

    let summary = ingest_files(
        &workspace,
        &organization,
        &args.inputs,
        window_days,
        collected_at,
    )?;
    write_json_to_stdout(&summary)
}

pub fn ingest_files(
    workspace: &Workspace,
    organization: &Organization,
    inputs: &[PathBuf],
    window_days: u32,
    collected_at: DateTime<Utc>,
) -> Result<IngestSummary> {
    let mut input = RawInput::default();
    for path in inputs {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read input {}", path.display()))?;
        input.extend(RawInput::parse(&raw, path)?);
    }
    if input.unassigned > 0 {
        tracing::warn!(
            count = input.unassigned,
            "skipping records without a repository field"
        );
    }

    let normalized = normalize_batch(
        organization,
        input
            .items
            .iter()
            .map(|(repository, raw)| (repository.as_str(), raw)),
    );
    for rejected in &normalized.rejected {
        tracing::warn!(
            repository = %rejected.repository,
            pr_number = ?rejected.pr_number,
            error = %rejected.error,
            "rejected raw record"
        );
    }

    let mut batch = CollectionBatch::new(organization, window_days, collected_at);
    batch.record_identities(&normalized.records);

    let writer = PartitionWriter::new(workspace.layout(), workspace.lock_timeout());
    let report = writer.write_batch(&batch, &normalized.records);
    let status = if report.is_complete() {
        BatchStatus::Complete
    } else {
        BatchStatus::Partial
    };

    let catalog =
        BatchCatalog::open(workspace.data_dir()).context("failed to open batch catalog")?;
    catalog
        .record_batch(&batch, status, report.files.len())
        .context("failed to record batch in catalog")?;

    tracing::info!(
        organization = %organization,
        batch_id = %batch.batch_id,
        records = normalized.records.len(),
        rejected = normalized.rejected_count(),
        files = report.files.len(),
        deferred = report.deferred.len(),
        "ingested batch"
    );

    Ok(IngestSummary {
        organization: organization.as_str().to_owned(),
        batch_id: batch.batch_id,
        collected_at,
        status,
        input_records: input.items.len() + input.unassigned,
        unassigned_records: input.unassigned,
        normalized_records: normalized.records.len(),
        rejected: normalized
            .rejected
            .iter()
            .map(|rejected| RejectionEntry {
                repository: rejected.repository.clone(),
                pr_number: rejected.pr_number,
                reason: rejected.error.to_string(),
            })
            .collect(),
        rows_written: report.rows_written(),
        files: report.files,
        deferred: report.deferred,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::RawInput;

    #[test]
    fn repository_keyed_object_is_flattened() {
        let input = RawInput::parse(
            r#"{"api": [{"number": 1}, {"number": 2}], "web": [{"number": 7}]}"#,
            Path::new("input.json"),
        )
        .expect("object input should parse");

        let repositories = input
            .items
            .iter()
            .map(|(repository, _)| repository.as_str())
            .collect::<Vec<_>>();
        assert_eq!(repositories, vec!["api", "api", "web"]);
        assert_eq!(input.unassigned, 0);
    }

    #[test]
    fn array_entries_need_a_repository() {
        let input = RawInput::parse(
            r#"[{"repository": "api", "number": 1}, {"number": 2}, {"repository": " ", "number": 3}]"#,
            Path::new("input.json"),
        )
        .expect("array input should parse");

        assert_eq!(input.items.len(), 1);
        assert_eq!(input.items[0].0, "api");
        assert_eq!(input.unassigned, 2);
    }

    #[test]
    fn other_shapes_are_errors() {
        assert!(RawInput::parse("42", Path::new("input.json")).is_err());
        assert!(RawInput::parse(r#"{"api": {"number": 1}}"#, Path::new("input.json")).is_err());
        assert!(RawInput::parse("not json", Path::new("input.json")).is_err());
    }
}
