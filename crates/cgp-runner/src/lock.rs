use crate::error::{JobError, Result};
use crate::fsutil::ensure_parent;
use chrono::Utc;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Advisory lock held by the existence of a file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn try_acquire(path: &Path) -> Result<Option<FileLock>> {
        ensure_parent(path)?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let payload = json!({
                    "pid": std::process::id(),
                    "acquired_at": Utc::now().to_rfc3339(),
                });
                let _ = writeln!(file, "{payload}");
                let _ = file.sync_all();
                Ok(Some(FileLock {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(JobError::io(path, e)),
        }
    }

    /// Retry every `retry_delay` until acquired or `max_wait` has passed.
    pub fn acquire(path: &Path, retry_delay: Duration, max_wait: Duration) -> Result<FileLock> {
        let start = Instant::now();
        let deadline = start + max_wait;
        loop {
            if let Some(lock) = FileLock::try_acquire(path)? {
                trace!(path = %path.display(), "lock acquired");
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                let waited = start.elapsed();
                warn!(
                    path = %path.display(),
                    waited_s = waited.as_secs_f64(),
                    "gave up waiting for lock"
                );
                return Err(JobError::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(retry_delay);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
