use cgp_runner::{FileLock, GrantKind, JobCoordinator, JobConfig, JobError};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

struct TempDir(PathBuf);

impl TempDir {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "cgp_lease_{}_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros(),
            NEXT_DIR.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        TempDir(dir)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

fn coordinator(dir: &Path, nsims: usize) -> JobCoordinator {
    let config = JobConfig::in_dir(dir, nsims)
        .with_lock_timing(Duration::from_millis(2), Duration::from_secs(30));
    JobCoordinator::new(config).expect("coordinator")
}

#[test]
fn first_pass_issues_every_id_then_sentinel() {
    let dir = TempDir::new("first_pass");
    let coord = coordinator(dir.path(), 5);
    for expected in 0..5 {
        let id = coord.acquire().expect("acquire");
        assert_eq!(id, expected);
        coord.release(id).expect("release");
    }
    assert_eq!(coord.acquire().expect("sentinel"), 5);
    assert_eq!(coord.acquire().expect("sentinel again"), 5);
    assert!(coord.status().expect("status").is_complete());
}

#[test]
fn unreleased_lease_is_reissued_as_timeout() {
    let dir = TempDir::new("timeout");
    let coord = coordinator(dir.path(), 2);
    let a = coord.acquire().expect("0");
    coord.release(a).expect("release 0");
    let b = coord.acquire().expect("1");
    assert_eq!(b, 1);
    // worker holding 1 dies without releasing
    let grant = coord.acquire_grant().expect("redo");
    assert_eq!(grant.id, 1);
    assert_eq!(grant.kind, GrantKind::TimeoutRedo);
    coord.release(1).expect("release 1");
    assert_eq!(coord.acquire().expect("sentinel"), 2);
}

#[test]
fn errors_are_redone_before_timeouts() {
    let dir = TempDir::new("error_first");
    let coord = coordinator(dir.path(), 3);

    let id = coord.acquire().expect("acquire");
    assert_eq!(id, 0);
    coord.release(id).expect("job 0 completed");

    let id = coord.acquire().expect("acquire");
    assert_eq!(id, 1);
    // job 1 times out

    let id = coord.acquire().expect("acquire");
    assert_eq!(id, 2);
    fs::write(dir.path().join("error_2.pickle"), "[2, 2]").expect("error artifact");
    coord.release(id).expect("job 2 completed");

    let grant = coord.acquire_grant().expect("error redo");
    assert_eq!((grant.id, grant.kind), (2, GrantKind::ErrorRedo));
    assert!(dir.path().join("job_redone_2.pickle").exists());
    assert!(!dir.path().join("error_2.pickle").exists());
    coord.release(2).expect("job 2 completed with success");

    let grant = coord.acquire_grant().expect("timeout redo");
    assert_eq!((grant.id, grant.kind), (1, GrantKind::TimeoutRedo));
    coord.release(1).expect("job 1 completed with success");

    assert_eq!(coord.acquire().expect("sentinel"), 3);
    let status = coord.status().expect("status");
    assert_eq!(status.redone, vec![2]);
    assert!(status.is_complete());
}

#[test]
fn concurrent_workers_never_share_a_lease() {
    let dir = TempDir::new("concurrent");
    let nsims = 16;
    let workers = 4;
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let coord = coordinator(dir.path(), nsims);
            thread::spawn(move || {
                (0..nsims / workers)
                    .map(|_| coord.acquire().expect("acquire"))
                    .collect::<Vec<usize>>()
            })
        })
        .collect();
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("worker thread"));
    }
    let unique: BTreeSet<usize> = all.iter().copied().collect();
    assert_eq!(all.len(), nsims);
    assert_eq!(unique, (0..nsims).collect::<BTreeSet<usize>>());
    assert_eq!(
        fs::read_to_string(dir.path().join("job")).expect("counter").trim(),
        nsims.to_string()
    );
}

#[test]
fn externally_held_lock_times_out() {
    let dir = TempDir::new("held");
    let config = JobConfig::in_dir(dir.path(), 3)
        .with_lock_timing(Duration::from_millis(20), Duration::from_millis(200));
    let coord = JobCoordinator::new(config).expect("coordinator");
    let _held = FileLock::try_acquire(&dir.path().join("lock"))
        .expect("io")
        .expect("lock");
    let start = Instant::now();
    let err = coord.acquire().expect_err("lock never frees");
    assert!(start.elapsed() >= Duration::from_millis(200));
    match err {
        JobError::LockTimeout { path, .. } => assert_eq!(path, dir.path().join("lock")),
        other => panic!("expected lock timeout, got {other}"),
    }
    assert!(!dir.path().join("job").exists());
}
