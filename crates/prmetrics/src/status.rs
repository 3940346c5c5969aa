use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use prmetrics_core::Organization;
use prmetrics_store::{BatchCatalog, CatalogBatch, LegacyFlatStore};
use serde::Serialize;

use crate::cli::StatusArgs;
use crate::workspace::{Workspace, organization};
use crate::write_json_to_stdout;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStatus {
    pub partition: String,
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatus {
    pub organization: String,
    pub data_dir: PathBuf,
    pub legacy_dir: PathBuf,
    pub batches: Vec<CatalogBatch>,
    pub partitions: Vec<PartitionStatus>,
    pub total_files: usize,
    /// Partitions holding more than one file; candidates for consolidation.
    pub fragmented_partitions: usize,
    pub legacy_files: Vec<PathBuf>,
}

pub fn run_status_command(workspace: &Path, args: StatusArgs) -> Result<()> {
    let workspace = Workspace::open(workspace)?;
    let organization = organization(args.org.org.as_deref())?;
    let status = store_status(&workspace, &organization)?;
    write_json_to_stdout(&status)
}

pub fn store_status(workspace: &Workspace, organization: &Organization) -> Result<StoreStatus> {
    let catalog =
        BatchCatalog::open(workspace.data_dir()).context("failed to open batch catalog")?;
    let batches = catalog
        .list_batches(organization.as_str())
        .context("failed to list catalog batches")?;

    let mut partitions = Vec::new();
    for partition in workspace
        .layout()
        .list_partitions(Some(organization.as_str()))
        .context("failed to list partitions")?
    {
        let bytes = partition
            .files
            .iter()
            .filter_map(|file| fs::metadata(file).ok())
            .map(|metadata| metadata.len())
            .sum();
        partitions.push(PartitionStatus {
            partition: partition.key.to_string(),
            files: partition.files.len(),
            bytes,
        });
    }

    let legacy_files = LegacyFlatStore::new(workspace.legacy_dir())
        .files_for(organization.as_str())
        .context("failed to list legacy files")?
        .into_iter()
        .map(|(path, _)| path)
        .collect();

    Ok(StoreStatus {
        organization: organization.as_str().to_owned(),
        data_dir: workspace.data_dir(),
        legacy_dir: workspace.legacy_dir(),
        total_files: partitions.iter().map(|partition| partition.files).sum(),
        fragmented_partitions: partitions
            .iter()
            .filter(|partition| partition.files > 1)
            .count(),
        batches,
        partitions,
        legacy_files,
    })
}
