use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use prmetrics_core::{HIVE_DEFAULT_PARTITION, PartitionKey};
use walkdir::WalkDir;

use crate::StoreError;

pub const LOCK_FILE_NAME: &str = ".lock";

const DATA_FILE_EXTENSION: &str = "parquet";

/// Hive-style directory tree: `org=<o>/repo=<r>/year=<yyyy>/month=<mm>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    root: PathBuf,
}

/// One partition directory and the data files currently visible in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDir {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub files: Vec<PathBuf>,
}

impl PartitionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_dir(&self, key: &PartitionKey) -> PathBuf {
        let (year, month) = match key.period {
            Some((year, month)) => (format!("{year:04}"), format!("{month:02}")),
            None => (
                HIVE_DEFAULT_PARTITION.to_owned(),
                HIVE_DEFAULT_PARTITION.to_owned(),
            ),
        };
        self.root
            .join(format!("org={}", escape_component(&key.organization)))
            .join(format!("repo={}", escape_component(&key.repository)))
            .join(format!("year={year}"))
            .join(format!("month={month}"))
    }

    /// Inverse of [`PartitionLayout::partition_dir`]; `None` for directories outside the tree.
    pub fn partition_key_for(&self, dir: &Path) -> Option<PartitionKey> {
        let relative = dir.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        let [org, repo, year, month] = parts.as_slice() else {
            return None;
        };

        let organization = unescape_component(org.strip_prefix("org=")?);
        let repository = unescape_component(repo.strip_prefix("repo=")?);
        let year = year.strip_prefix("year=")?;
        let month = month.strip_prefix("month=")?;

        let period = if year == HIVE_DEFAULT_PARTITION && month == HIVE_DEFAULT_PARTITION {
            None
        } else {
            let year = year.parse::<i32>().ok()?;
            let month = month.parse::<u32>().ok().filter(|m| (1..=12).contains(m))?;
            Some((year, month))
        };

        Some(PartitionKey {
            organization,
            repository,
            period,
        })
    }

    /// Every partition under the root, optionally limited to one organization.
    pub fn list_partitions(
        &self,
        organization: Option<&str>,
    ) -> Result<Vec<PartitionDir>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut partitions = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(4)
            .max_depth(4)
            .sort_by_file_name()
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(key) = self.partition_key_for(entry.path()) else {
                tracing::debug!(path = %entry.path().display(), "skipping non-partition directory");
                continue;
            };
            if organization.is_some_and(|org| org != key.organization) {
                continue;
            }
            let files = data_files(entry.path())?;
            partitions.push(PartitionDir {
                key,
                path: entry.path().to_path_buf(),
                files,
            });
        }

        Ok(partitions)
    }
}

/// `batch-<collected_at>-<batch_id>[-<n>].parquet`
pub fn batch_file_name(collected_at: DateTime<Utc>, batch_id: &str, sequence: usize) -> String {
    let stamp = collected_at.format("%Y%m%dT%H%M%S%3fZ");
    if sequence == 0 {
        format!("batch-{stamp}-{batch_id}.{DATA_FILE_EXTENSION}")
    } else {
        format!("batch-{stamp}-{batch_id}-{sequence}.{DATA_FILE_EXTENSION}")
    }
}

/// Temp files and the lock file start with a dot and are never data.
pub fn is_data_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && path
            .extension()
            .is_some_and(|extension| extension == DATA_FILE_EXTENSION)
}

pub fn data_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && is_data_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn escape_component(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('/', "%2F")
        .replace('\\', "%5C")
        .replace('=', "%3D")
}

fn unescape_component(value: &str) -> String {
    value
        .replace("%2F", "/")
        .replace("%5C", "\\")
        .replace("%3D", "=")
        .replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;

    fn key(period: Option<(i32, u32)>) -> PartitionKey {
        PartitionKey {
            organization: "acme".to_owned(),
            repository: "svc".to_owned(),
            period,
        }
    }

    #[test]
    fn partition_dirs_follow_hive_layout_and_parse_back() {
        let layout = PartitionLayout::new("/data");

        let dated = layout.partition_dir(&key(Some((2025, 3))));
        assert_eq!(
            dated,
            PathBuf::from("/data/org=acme/repo=svc/year=2025/month=03")
        );
        assert_eq!(layout.partition_key_for(&dated), Some(key(Some((2025, 3)))));

        let undated = layout.partition_dir(&key(None));
        assert!(undated.ends_with(
            "year=__HIVE_DEFAULT_PARTITION__/month=__HIVE_DEFAULT_PARTITION__"
        ));
        assert_eq!(layout.partition_key_for(&undated), Some(key(None)));
    }

    #[test]
    fn repository_names_with_separators_are_escaped() {
        let layout = PartitionLayout::new("/data");
        let mut odd = key(Some((2024, 12)));
        odd.repository = "team/svc=1%".to_owned();

        let dir = layout.partition_dir(&odd);
        assert_eq!(dir.components().count(), 6);
        assert_eq!(layout.partition_key_for(&dir), Some(odd));
    }

    #[test]
    fn rejects_foreign_directories() {
        let layout = PartitionLayout::new("/data");
        assert_eq!(
            layout.partition_key_for(Path::new("/data/org=acme/repo=svc/year=2025/month=13")),
            None
        );
        assert_eq!(
            layout.partition_key_for(Path::new("/data/acme/svc/2025/01")),
            None
        );
        assert_eq!(layout.partition_key_for(Path::new("/elsewhere")), None);
    }

    #[test]
    fn list_partitions_skips_temp_and_lock_files() {
        let temp = tempdir().expect("tempdir");
        let layout = PartitionLayout::new(temp.path());
        let dir = layout.partition_dir(&key(Some((2025, 1))));
        fs::create_dir_all(&dir).expect("create partition");
        fs::write(dir.join("batch-a.parquet"), b"x").expect("write data");
        fs::write(dir.join(".tmp-123.partial"), b"x").expect("write temp");
        fs::write(dir.join(LOCK_FILE_NAME), b"").expect("write lock");

        let other = layout.partition_dir(&PartitionKey {
            organization: "other".to_owned(),
            repository: "svc".to_owned(),
            period: None,
        });
        fs::create_dir_all(&other).expect("create other partition");

        let all = layout.list_partitions(None).expect("list all");
        assert_eq!(all.len(), 2);

        let acme = layout.list_partitions(Some("acme")).expect("list acme");
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].files, vec![dir.join("batch-a.parquet")]);
    }

    #[test]
    fn batch_file_names_are_sortable_and_sequenced() {
        let at = Utc
            .with_ymd_and_hms(2025, 1, 2, 3, 4, 5)
            .single()
            .expect("timestamp");
        assert_eq!(
            batch_file_name(at, "abc", 0),
            "batch-20250102T030405000Z-abc.parquet"
        );
        assert_eq!(
            batch_file_name(at, "abc", 2),
            "batch-20250102T030405000Z-abc-2.parquet"
        );
    }
}
