use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use prmetrics_config::{
    ORGANIZATION_ENV, PrMetricsConfig, config_path, ensure_workspace_config, resolve_organization,
    validate_config,
};
use prmetrics_core::Organization;
use prmetrics_store::{MetricsStore, PartitionLayout};

/// Resolved workspace root plus its loaded configuration.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub config: PrMetricsConfig,
}

impl Workspace {
    pub fn open(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve workspace path {}", root.display()))?;

        let config = ensure_workspace_config(&root).with_context(|| {
            format!(
                "failed to load or create workspace config at {}",
                config_path(&root).display()
            )
        })?;
        for warning in validate_config(&config) {
            tracing::warn!(%warning, "config warning");
        }

        Ok(Self { root, config })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir(&self.root)
    }

    pub fn legacy_dir(&self) -> PathBuf {
        self.config.legacy_dir(&self.root)
    }

    pub fn layout(&self) -> PartitionLayout {
        PartitionLayout::new(self.data_dir())
    }

    pub fn store(&self) -> MetricsStore {
        MetricsStore::open(self.data_dir(), self.legacy_dir())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.store.lock_timeout_ms)
    }
}

/// `--org` first, then `PR_METRICS_ORG`.
pub fn organization(flag: Option<&str>) -> Result<Organization> {
    let env = std::env::var(ORGANIZATION_ENV).ok();
    Ok(resolve_organization(flag, env.as_deref())?)
}
