use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::StoreError;
use crate::layout::LOCK_FILE_NAME;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Exclusive advisory lock on one partition directory, released on drop.
#[derive(Debug)]
pub struct PartitionLock {
    file: File,
    path: PathBuf,
}

impl PartitionLock {
    /// Creates the partition directory if needed and waits at most `timeout` for the lock.
    pub fn acquire(partition_dir: &Path, timeout: Duration) -> Result<Self, StoreError> {
        fs::create_dir_all(partition_dir)?;
        let path = partition_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file, path }),
                Err(err) if is_contended(&err) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(StoreError::WriteContention {
                            partition: partition_dir.display().to_string(),
                            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    thread::sleep(POLL_INTERVAL.min(timeout - waited));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PartitionLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release partition lock");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
