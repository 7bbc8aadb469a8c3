use crate::error::{JobError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RETRY_DELAY: f64 = 0.2;
pub const DEFAULT_MAX_WAIT: f64 = 100.0;

fn default_retry_delay() -> f64 {
    DEFAULT_RETRY_DELAY
}

fn default_max_wait() -> f64 {
    DEFAULT_MAX_WAIT
}

fn default_sim_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(rename = "Nsims")]
    pub nsims: usize,
    pub jobfile: PathBuf,
    pub lockfile: PathBuf,
    /// Directory scanned for timeout and error markers.
    #[serde(rename = "SimID", default = "default_sim_dir")]
    pub sim_dir: PathBuf,
    pub errorfile: PathBuf,
    /// Seconds between lock attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    /// Seconds before giving up on the lock.
    #[serde(default = "default_max_wait")]
    pub max_wait: f64,
}

impl JobConfig {
    pub fn new(
        nsims: usize,
        jobfile: impl Into<PathBuf>,
        lockfile: impl Into<PathBuf>,
        sim_dir: impl Into<PathBuf>,
        errorfile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            nsims,
            jobfile: jobfile.into(),
            lockfile: lockfile.into(),
            sim_dir: sim_dir.into(),
            errorfile: errorfile.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn in_dir(dir: &Path, nsims: usize) -> Self {
        Self::new(
            nsims,
            dir.join("job"),
            dir.join("lock"),
            dir,
            dir.join("error"),
        )
    }

    pub fn with_lock_timing(mut self, retry_delay: Duration, max_wait: Duration) -> Self {
        self.retry_delay = retry_delay.as_secs_f64();
        self.max_wait = max_wait.as_secs_f64();
        self
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            nsims: parse_key(&lookup, "Nsims")?,
            jobfile: required(&lookup, "jobfile")?.into(),
            lockfile: required(&lookup, "lockfile")?.into(),
            sim_dir: lookup("SimID").map(PathBuf::from).unwrap_or_else(default_sim_dir),
            errorfile: required(&lookup, "errorfile")?.into(),
            retry_delay: optional_key(&lookup, "retry_delay")?.unwrap_or(DEFAULT_RETRY_DELAY),
            max_wait: optional_key(&lookup, "max_wait")?.unwrap_or(DEFAULT_MAX_WAIT),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| JobError::io(path, e))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| JobError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Lock timings must be non-negative, and markers must land in the
    /// directory that is scanned for them.
    pub fn validate(&self) -> Result<()> {
        self.retry_delay_duration()?;
        self.max_wait_duration()?;
        for (key, path) in [("jobfile", &self.jobfile), ("errorfile", &self.errorfile)] {
            let dir = marker_dir(path);
            if !same_dir(dir, &self.sim_dir) {
                return Err(JobError::Config(format!(
                    "{key}={} writes markers to {} but SimID scans {}",
                    path.display(),
                    dir.display(),
                    self.sim_dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn retry_delay_duration(&self) -> Result<Duration> {
        seconds("retry_delay", self.retry_delay)
    }

    pub fn max_wait_duration(&self) -> Result<Duration> {
        seconds("max_wait", self.max_wait)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(flatten)]
    pub job: JobConfig,
    pub datafile: PathBuf,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Nloci")]
    pub nloci: usize,
    #[serde(rename = "TASK_ID", default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Stop this worker after this many failed replicates.
    #[serde(default)]
    pub max_failures: Option<usize>,
}

impl BatchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let job = JobConfig::from_lookup(&lookup)?;
        Ok(Self {
            job,
            datafile: required(&lookup, "datafile")?.into(),
            model: required(&lookup, "Model")?,
            nloci: parse_key(&lookup, "Nloci")?,
            task_id: lookup("TASK_ID"),
            workdir: lookup("PBS_O_WORKDIR")
                .or_else(|| lookup("SUBMITDIR"))
                .map(PathBuf::from),
            max_failures: optional_key(&lookup, "max_failures")?,
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| JobError::io(path, e))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| JobError::Config(format!("{}: {}", path.display(), e)))?;
        config.job.validate()?;
        Ok(config)
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key).ok_or_else(|| JobError::Config(format!("missing setting {key}")))
}

fn parse_key<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<T> {
    let raw = required(lookup, key)?;
    raw.trim()
        .parse()
        .map_err(|_| JobError::Config(format!("{key}={raw:?} is not a valid value")))
}

fn optional_key<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(_) => parse_key(lookup, key).map(Some),
        None => Ok(None),
    }
}

fn marker_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| JobError::Config(format!("{key}={value} is not a non-negative duration")))
}
