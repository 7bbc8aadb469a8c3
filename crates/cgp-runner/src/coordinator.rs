use crate::config::JobConfig;
use crate::error::{JobError, Result};
use crate::fsutil::{atomic_write_bytes, ensure_parent, suffixed, touch};
use crate::lock::FileLock;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::info;

const TIMEOUT_INFIX: &str = "_timeout_";
const REDONE_INFIX: &str = "_redone_";
const ARTIFACT_EXT: &str = ".pickle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Fresh,
    ErrorRedo,
    TimeoutRedo,
    /// Nothing left to do; the id equals `Nsims`.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub id: usize,
    pub kind: GrantKind,
}

impl Grant {
    pub fn is_work(&self) -> bool {
        self.kind != GrantKind::Exhausted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseStatus {
    pub nsims: usize,
    pub issued: usize,
    pub leased: Vec<usize>,
    pub errored: Vec<usize>,
    pub redone: Vec<usize>,
}

impl LeaseStatus {
    pub fn is_complete(&self) -> bool {
        self.issued >= self.nsims && self.leased.is_empty() && self.errored.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct JobCoordinator {
    config: JobConfig,
    retry_delay: Duration,
    max_wait: Duration,
}

impl JobCoordinator {
    pub fn new(config: JobConfig) -> Result<Self> {
        config.validate()?;
        let retry_delay = config.retry_delay_duration()?;
        let max_wait = config.max_wait_duration()?;
        Ok(Self {
            config,
            retry_delay,
            max_wait,
        })
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn nsims(&self) -> usize {
        self.config.nsims
    }

    pub fn timeout_marker(&self, id: usize) -> PathBuf {
        suffixed(&self.config.jobfile, &format!("{TIMEOUT_INFIX}{id}"))
    }

    pub fn error_artifact(&self, id: usize) -> PathBuf {
        suffixed(&self.config.errorfile, &format!("_{id}{ARTIFACT_EXT}"))
    }

    pub fn redone_artifact(&self, id: usize) -> PathBuf {
        suffixed(&self.config.jobfile, &format!("{REDONE_INFIX}{id}{ARTIFACT_EXT}"))
    }

    pub fn acquire(&self) -> Result<usize> {
        Ok(self.acquire_grant()?.id)
    }

    pub fn acquire_grant(&self) -> Result<Grant> {
        let _lock = FileLock::acquire(&self.config.lockfile, self.retry_delay, self.max_wait)?;

        let next = self.read_counter_or_init()?;
        if next < self.config.nsims {
            touch(&self.timeout_marker(next))?;
            self.write_counter(next + 1)?;
            info!(job_id = next, "jobfile - next job");
            return Ok(Grant {
                id: next,
                kind: GrantKind::Fresh,
            });
        }

        if let Some(id) = self.pick_oldest(&self.error_ids()?, |id| self.error_artifact(id))? {
            touch(&self.timeout_marker(id))?;
            let from = self.error_artifact(id);
            let to = self.redone_artifact(id);
            ensure_parent(&to)?;
            fs::rename(&from, &to).map_err(|e| JobError::io(&from, e))?;
            info!(job_id = id, "redoing failed job");
            return Ok(Grant {
                id,
                kind: GrantKind::ErrorRedo,
            });
        }

        if let Some(id) = self.pick_oldest(&self.timeout_ids()?, |id| self.timeout_marker(id))? {
            touch(&self.timeout_marker(id))?;
            info!(job_id = id, "redoing timed out job");
            return Ok(Grant {
                id,
                kind: GrantKind::TimeoutRedo,
            });
        }

        info!("jobfile - no jobs left");
        Ok(Grant {
            id: self.config.nsims,
            kind: GrantKind::Exhausted,
        })
    }

    pub fn release(&self, id: usize) -> Result<()> {
        let marker = self.timeout_marker(id);
        match fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(JobError::LeaseInconsistency { id, marker })
            }
            Err(e) => Err(JobError::io(&marker, e)),
        }
    }

    pub fn status(&self) -> Result<LeaseStatus> {
        let issued = match fs::read_to_string(&self.config.jobfile) {
            Ok(text) => parse_counter(&self.config.jobfile, &text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(JobError::io(&self.config.jobfile, e)),
        };
        Ok(LeaseStatus {
            nsims: self.config.nsims,
            issued: issued.min(self.config.nsims),
            leased: self.timeout_ids()?,
            errored: self.error_ids()?,
            redone: self.marker_ids(&self.config.jobfile, REDONE_INFIX, ARTIFACT_EXT)?,
        })
    }

    fn read_counter_or_init(&self) -> Result<usize> {
        let path = &self.config.jobfile;
        match fs::read_to_string(path) {
            Ok(text) => parse_counter(path, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.write_counter(0)?;
                Ok(0)
            }
            Err(e) => Err(JobError::io(path, e)),
        }
    }

    fn write_counter(&self, value: usize) -> Result<()> {
        atomic_write_bytes(&self.config.jobfile, value.to_string().as_bytes())
    }

    fn timeout_ids(&self) -> Result<Vec<usize>> {
        self.marker_ids(&self.config.jobfile, TIMEOUT_INFIX, "")
    }

    fn error_ids(&self) -> Result<Vec<usize>> {
        self.marker_ids(&self.config.errorfile, "_", ARTIFACT_EXT)
    }

    fn marker_ids(&self, stem: &Path, infix: &str, ext: &str) -> Result<Vec<usize>> {
        let Some(stem_name) = stem.file_name().and_then(|s| s.to_str()) else {
            return Err(JobError::Config(format!(
                "{} has no usable file name",
                stem.display()
            )));
        };
        let prefix = format!("{stem_name}{infix}");
        let entries = match fs::read_dir(&self.config.sim_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JobError::io(&self.config.sim_dir, e)),
        };
        let mut ids: Vec<usize> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let digits = name.strip_prefix(&prefix)?.strip_suffix(ext)?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                digits.parse::<usize>().ok()
            })
            .filter(|&id| id < self.config.nsims)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Least recently touched candidate, lowest id on ties.
    fn pick_oldest(&self, ids: &[usize], path_of: impl Fn(usize) -> PathBuf) -> Result<Option<usize>> {
        let mut best: Option<(SystemTime, usize)> = None;
        for &id in ids {
            let path = path_of(id);
            let modified = match fs::metadata(&path) {
                Ok(meta) => meta.modified().map_err(|e| JobError::io(&path, e))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(JobError::io(&path, e)),
            };
            let better = match best {
                None => true,
                Some((t, _)) => modified < t,
            };
            if better {
                best = Some((modified, id));
            }
        }
        Ok(best.map(|(_, id)| id))
    }
}

fn parse_counter(path: &Path, text: &str) -> Result<usize> {
    text.trim()
        .parse()
        .map_err(|_| JobError::CorruptCounter {
            path: path.to_path_buf(),
            content: text.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs::File;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "cgp_coordinator_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn coordinator(dir: &Path, nsims: usize) -> JobCoordinator {
        let config = JobConfig::in_dir(dir, nsims)
            .with_lock_timing(Duration::from_millis(5), Duration::from_secs(5));
        JobCoordinator::new(config).expect("coordinator")
    }

    fn backdate(path: &Path, secs_ago: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs_ago);
        File::options()
            .append(true)
            .open(path)
            .expect("open")
            .set_modified(when)
            .expect("set mtime");
    }

    #[test]
    fn artifact_names_follow_stems() {
        let coord = coordinator(Path::new("/runs/a"), 4);
        assert_eq!(coord.timeout_marker(2), PathBuf::from("/runs/a/job_timeout_2"));
        assert_eq!(coord.error_artifact(2), PathBuf::from("/runs/a/error_2.pickle"));
        assert_eq!(coord.redone_artifact(2), PathBuf::from("/runs/a/job_redone_2.pickle"));
    }

    #[test]
    fn counter_is_created_lazily_under_lock() {
        let dir = temp_dir("lazy");
        let coord = coordinator(&dir, 2);
        assert!(!dir.join("job").exists());
        let grant = coord.acquire_grant().expect("acquire");
        assert_eq!(grant, Grant { id: 0, kind: GrantKind::Fresh });
        assert_eq!(fs::read_to_string(dir.join("job")).expect("counter"), "1");
        assert!(dir.join("job_timeout_0").exists());
        assert!(!dir.join("lock").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn release_without_marker_is_inconsistent() {
        let dir = temp_dir("release");
        let coord = coordinator(&dir, 2);
        let err = coord.release(1).expect_err("never leased");
        assert!(matches!(err, JobError::LeaseInconsistency { id: 1, .. }));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_counter_aborts_acquire_and_frees_lock() {
        let dir = temp_dir("corrupt");
        fs::write(dir.join("job"), "seven").expect("write counter");
        let coord = coordinator(&dir, 2);
        let err = coord.acquire().expect_err("corrupt");
        assert!(matches!(err, JobError::CorruptCounter { .. }));
        assert!(!dir.join("lock").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn oldest_timeout_is_redone_first() {
        let dir = temp_dir("oldest");
        let coord = coordinator(&dir, 3);
        for _ in 0..3 {
            coord.acquire().expect("first pass");
        }
        backdate(&coord.timeout_marker(0), 10);
        backdate(&coord.timeout_marker(1), 30);
        backdate(&coord.timeout_marker(2), 20);
        let order: Vec<usize> = (0..3).map(|_| coord.acquire().expect("redo")).collect();
        // each redo touches its marker, which sends it to the back of the queue
        assert_eq!(order, vec![1, 2, 0]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unrelated_and_out_of_range_files_are_ignored() {
        let dir = temp_dir("ignore");
        let coord = coordinator(&dir, 2);
        coord.acquire().expect("0");
        coord.release(0).expect("release 0");
        coord.acquire().expect("1");
        coord.release(1).expect("release 1");
        fs::write(dir.join("error_7.pickle"), "[]").expect("out of range");
        fs::write(dir.join("error_x.pickle"), "[]").expect("not an id");
        fs::write(dir.join("job_timeout_1.bak"), "").expect("wrong suffix");
        fs::write(dir.join("errorlog_1.pickle"), "").expect("other stem");
        assert_eq!(coord.acquire_grant().expect("sentinel").kind, GrantKind::Exhausted);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn coordinator_refuses_markers_outside_scan_directory() {
        let dir = temp_dir("scan_dir");
        let mut config = JobConfig::in_dir(&dir, 2);
        config.errorfile = dir.join("failures").join("error");
        let err = JobCoordinator::new(config).expect_err("errors would never be redone");
        assert!(matches!(err, JobError::Config(_)));
        assert!(!dir.join("job").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn status_reports_outstanding_work() {
        let dir = temp_dir("status");
        let coord = coordinator(&dir, 3);
        let empty = coord.status().expect("status");
        assert_eq!(empty.issued, 0);
        assert!(!empty.is_complete());
        for _ in 0..3 {
            coord.acquire().expect("first pass");
        }
        coord.release(0).expect("release");
        coord.release(2).expect("release");
        fs::write(coord.error_artifact(2), "[1, 2]").expect("error");
        let status = coord.status().expect("status");
        assert_eq!(status.issued, 3);
        assert_eq!(status.leased, vec![1]);
        assert_eq!(status.errored, vec![2]);
        assert!(status.redone.is_empty());
        assert!(!status.is_complete());
        let _ = fs::remove_dir_all(dir);
    }
}
