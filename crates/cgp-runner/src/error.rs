use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("config_invalid: {0}")]
    Config(String),
    #[error("lease_inconsistency: job {id} has no timeout marker at {}", marker.display())]
    LeaseInconsistency { id: usize, marker: PathBuf },
    #[error("lock_timeout: {} still held after {:.1}s", path.display(), waited.as_secs_f64())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("counter_corrupt: {} holds {content:?}", path.display())]
    CorruptCounter { path: PathBuf, content: String },
    #[error("io_error: {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JobError::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable snake_case code, used in CLI error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Config(_) => "config_invalid",
            JobError::LeaseInconsistency { .. } => "lease_inconsistency",
            JobError::LockTimeout { .. } => "lock_timeout",
            JobError::CorruptCounter { .. } => "counter_corrupt",
            JobError::Io { .. } => "io_error",
        }
    }
}
