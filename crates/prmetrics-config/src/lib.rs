use std::fs;
use std::path::{Path, PathBuf};

use prmetrics_core::{Organization, SizeThresholds};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PRMETRICS_DIR_NAME: &str = ".prmetrics";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const ORGANIZATION_ENV: &str = "PR_METRICS_ORG";
pub const DEFAULT_DATA_DIR: &str = "output/data";
pub const DEFAULT_LEGACY_DIR: &str = "output";
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DAY_WINDOW: u32 = 14;
pub const DEFAULT_MIN_PRS: usize = 3;
pub const DEFAULT_TOP_CONTRIBUTORS: usize = 5;
pub const DEFAULT_TREND_EPSILON: f64 = 5.0;
pub const DEFAULT_TOP_SHARE: f64 = 0.2;
pub const DEFAULT_MODERATE_PERCENT: f64 = 60.0;
pub const DEFAULT_HIGH_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PrMetricsConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub sizes: SizeThresholds,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_legacy_dir")]
    pub legacy_dir: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            legacy_dir: default_legacy_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_day_window")]
    pub day_window: u32,
    #[serde(default = "default_min_prs")]
    pub min_prs: usize,
    #[serde(default = "default_top_contributors")]
    pub top_contributors: usize,
    /// Percentage points a rate must move before a trend is reported.
    #[serde(default = "default_trend_epsilon")]
    pub trend_epsilon: f64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            day_window: default_day_window(),
            min_prs: default_min_prs(),
            top_contributors: default_top_contributors(),
            trend_epsilon: default_trend_epsilon(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Fraction of contributors counted as "top" for the bus factor.
    #[serde(default = "default_top_share")]
    pub top_share: f64,
    #[serde(default = "default_moderate_percent")]
    pub moderate_percent: f64,
    #[serde(default = "default_high_percent")]
    pub high_percent: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            top_share: default_top_share(),
            moderate_percent: default_moderate_percent(),
            high_percent: default_high_percent(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetentionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_batches: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("organization is required: pass --org <name> or set PR_METRICS_ORG")]
    MissingOrganization,
}

pub fn prmetrics_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(PRMETRICS_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    prmetrics_dir(workspace_root).join(CONFIG_FILE_NAME)
}

impl PrMetricsConfig {
    /// Data directory, resolved against the workspace root when relative.
    pub fn data_dir(&self, workspace_root: impl AsRef<Path>) -> PathBuf {
        resolve_dir(workspace_root.as_ref(), &self.store.data_dir)
    }

    pub fn legacy_dir(&self, workspace_root: impl AsRef<Path>) -> PathBuf {
        resolve_dir(workspace_root.as_ref(), &self.store.legacy_dir)
    }
}

fn resolve_dir(workspace_root: &Path, configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<PrMetricsConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(PrMetricsConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PrMetricsConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<PrMetricsConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(prmetrics_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = PrMetricsConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Picks the organization from the command-line flag, then the environment value.
/// There is no fallback organization.
pub fn resolve_organization(
    flag: Option<&str>,
    env: Option<&str>,
) -> Result<Organization, ConfigError> {
    [flag, env]
        .into_iter()
        .flatten()
        .find_map(Organization::new)
        .ok_or(ConfigError::MissingOrganization)
}

/// Settings that load fine but will give surprising results.
pub fn validate_config(config: &PrMetricsConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    let sizes = &config.sizes;
    if !(sizes.small <= sizes.medium && sizes.medium <= sizes.large) {
        warnings.push(format!(
            "sizes thresholds are not ascending (small={}, medium={}, large={})",
            sizes.small, sizes.medium, sizes.large
        ));
    }

    let health = &config.health;
    if !(health.top_share > 0.0 && health.top_share <= 1.0) {
        warnings.push(format!(
            "health.top_share={} is outside (0, 1]",
            health.top_share
        ));
    }
    if health.moderate_percent > health.high_percent {
        warnings.push(format!(
            "health.moderate_percent={} exceeds health.high_percent={}",
            health.moderate_percent, health.high_percent
        ));
    }

    if config.query.day_window == 0 {
        warnings.push("query.day_window=0 selects no pull requests".to_owned());
    }
    if config.query.trend_epsilon < 0.0 {
        warnings.push(format!(
            "query.trend_epsilon={} is negative",
            config.query.trend_epsilon
        ));
    }
    if config.retention.keep_batches == Some(0) {
        warnings.push("retention.keep_batches=0 expires every known batch".to_owned());
    }

    warnings
}

fn default_data_dir() -> String {
    DEFAULT_DATA_DIR.to_owned()
}

fn default_legacy_dir() -> String {
    DEFAULT_LEGACY_DIR.to_owned()
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_day_window() -> u32 {
    DEFAULT_DAY_WINDOW
}

fn default_min_prs() -> usize {
    DEFAULT_MIN_PRS
}

fn default_top_contributors() -> usize {
    DEFAULT_TOP_CONTRIBUTORS
}

fn default_trend_epsilon() -> f64 {
    DEFAULT_TREND_EPSILON
}

fn default_top_share() -> f64 {
    DEFAULT_TOP_SHARE
}

fn default_moderate_percent() -> f64 {
    DEFAULT_MODERATE_PERCENT
}

fn default_high_percent() -> f64 {
    DEFAULT_HIGH_PERCENT
}

fn normalize_dir(input: &str, fallback: fn() -> String) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_owned()
    }
}

fn normalize_config(mut config: PrMetricsConfig) -> PrMetricsConfig {
    config.store.data_dir = normalize_dir(&config.store.data_dir, default_data_dir);
    config.store.legacy_dir = normalize_dir(&config.store.legacy_dir, default_legacy_dir);

    if !config.query.trend_epsilon.is_finite() {
        config.query.trend_epsilon = default_trend_epsilon();
    }
    if !config.health.top_share.is_finite() {
        config.health.top_share = default_top_share();
    }

    config
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn ensure_workspace_config_creates_default_file() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();

        let config = ensure_workspace_config(workspace).expect("ensure config");

        assert_eq!(config.store.data_dir, DEFAULT_DATA_DIR);
        assert_eq!(config.query.day_window, 14);
        assert_eq!(config.query.min_prs, 3);
        assert_eq!(config.sizes, SizeThresholds::default());
        assert!(config_path(workspace).exists());

        let content = fs::read_to_string(config_path(workspace)).expect("read config file");
        assert!(content.contains("[store]"));
        assert!(content.contains("[sizes]"));
        assert!(!content.contains("keep_batches"));
    }

    #[test]
    fn load_workspace_config_parses_partial_sections() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();
        fs::create_dir_all(prmetrics_dir(workspace)).expect("create .prmetrics");

        let raw = r#"
[store]
data_dir = "  /var/lib/prmetrics  "
legacy_dir = " "

[query]
day_window = 30

[sizes]
small = 10
medium = 100
large = 500

[retention]
keep_batches = 3
"#;
        fs::write(config_path(workspace), raw).expect("write config");

        let config = load_workspace_config(workspace).expect("load config");

        assert_eq!(config.store.data_dir, "/var/lib/prmetrics");
        assert_eq!(config.store.legacy_dir, DEFAULT_LEGACY_DIR);
        assert_eq!(config.store.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
        assert_eq!(config.query.day_window, 30);
        assert_eq!(config.query.min_prs, DEFAULT_MIN_PRS);
        assert_eq!(config.sizes.medium, 100);
        assert_eq!(config.retention.keep_batches, Some(3));
        assert_eq!(config.retention.max_age_days, None);
        assert_eq!(
            config.data_dir(workspace),
            PathBuf::from("/var/lib/prmetrics")
        );
        assert_eq!(config.legacy_dir(workspace), workspace.join("output"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let temp = tempdir().expect("tempdir");
        let config = load_workspace_config(temp.path()).expect("load config");
        assert_eq!(config, PrMetricsConfig::default());
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn organization_prefers_flag_then_environment() {
        let org = resolve_organization(Some("My_Org"), Some("other")).expect("flag");
        assert_eq!(org.as_str(), "my-org");

        let org = resolve_organization(None, Some("Env Org")).expect("env");
        assert_eq!(org.as_str(), "env-org");

        let org = resolve_organization(Some("  "), Some("fallback")).expect("blank flag");
        assert_eq!(org.as_str(), "fallback");

        assert!(matches!(
            resolve_organization(None, None),
            Err(ConfigError::MissingOrganization)
        ));
    }

    #[test]
    fn validate_config_flags_inconsistent_thresholds() {
        let mut config = PrMetricsConfig::default();
        config.sizes = SizeThresholds {
            small: 500,
            medium: 300,
            large: 1000,
        };
        config.health.moderate_percent = 90.0;
        config.health.top_share = 1.5;

        let warnings = validate_config(&config);
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("not ascending")));
        assert!(warnings.iter().any(|w| w.contains("top_share")));
        assert!(warnings.iter().any(|w| w.contains("moderate_percent")));
    }
}
