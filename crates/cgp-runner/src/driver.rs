use crate::config::BatchConfig;
use crate::coordinator::{GrantKind, JobCoordinator};
use crate::fsutil::{atomic_write_json_pretty, suffixed};
use anyhow::{anyhow, Context, Result};
use cgp_model::study::{self, StudyTables};
use cgp_model::ModelError;
use chrono::Utc;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub trait Replicate {
    fn run(&mut self, job_id: usize) -> Result<StudyTables>;
}

impl<F> Replicate for F
where
    F: FnMut(usize) -> Result<StudyTables>,
{
    fn run(&mut self, job_id: usize) -> Result<StudyTables> {
        self(job_id)
    }
}

#[derive(Debug, Clone)]
pub struct StudyReplicate {
    study: String,
    nloci: usize,
}

impl StudyReplicate {
    pub fn new(study: &str, nloci: usize) -> std::result::Result<Self, ModelError> {
        if !study::STUDY_NAMES.contains(&study) {
            return Err(ModelError::UnknownModel(format!(
                "{study} (known studies: {})",
                study::STUDY_NAMES.join(", ")
            )));
        }
        study::check_loci(nloci)?;
        Ok(Self {
            study: study.to_string(),
            nloci,
        })
    }
}

impl Replicate for StudyReplicate {
    fn run(&mut self, job_id: usize) -> Result<StudyTables> {
        let seed = study::replicate_seed(self.nloci, job_id);
        study::run_study(&self.study, self.nloci, seed)
            .with_context(|| format!("{} replicate {job_id}", self.study))
    }
}

#[derive(Debug, Serialize)]
struct ResultsArtifact<'a> {
    job_id: usize,
    completed_at: String,
    model: &'a str,
    nloci: usize,
    #[serde(flatten)]
    tables: &'a StudyTables,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub completed: Vec<usize>,
    pub failed: Vec<usize>,
    /// Ids that were reissued to this worker after an error or timeout.
    pub redone: Vec<usize>,
    /// Stopped because `max_failures` was reached, not because work ran out.
    pub stopped_early: bool,
}

pub fn results_path(datafile: &Path, job_id: usize) -> PathBuf {
    suffixed(datafile, &format!("_{job_id}.json"))
}

/// Lease ids until the coordinator reports none left.
pub fn run_batch(config: &BatchConfig, replicate: &mut impl Replicate) -> Result<BatchSummary> {
    let coordinator = JobCoordinator::new(config.job.clone())?;
    let mut summary = BatchSummary::default();
    loop {
        let grant = coordinator.acquire_grant()?;
        if !grant.is_work() {
            break;
        }
        let id = grant.id;
        if matches!(grant.kind, GrantKind::ErrorRedo | GrantKind::TimeoutRedo) {
            summary.redone.push(id);
        }
        info!(job_id = id, "starting solving rep nr");
        match run_one(config, replicate, id) {
            Ok(path) => {
                coordinator.release(id)?;
                info!(job_id = id, results = %path.display(), "finished solving rep nr");
                summary.completed.push(id);
            }
            Err(err) => {
                error!(
                    job_id = id,
                    error = %format!("{err:#}"),
                    "exception caught during solution of replicate"
                );
                let marker = coordinator.error_artifact(id);
                atomic_write_json_pretty(&marker, &(config.nloci, id))
                    .with_context(|| format!("recording failure of replicate {id}"))?;
                summary.failed.push(id);
                if config
                    .max_failures
                    .is_some_and(|limit| summary.failed.len() >= limit)
                {
                    summary.stopped_early = true;
                    break;
                }
            }
        }
    }
    info!(
        completed = summary.completed.len(),
        failed = summary.failed.len(),
        "no jobs left for this worker"
    );
    Ok(summary)
}

fn run_one(config: &BatchConfig, replicate: &mut impl Replicate, id: usize) -> Result<PathBuf> {
    let tables = panic::catch_unwind(AssertUnwindSafe(|| replicate.run(id)))
        .map_err(|payload| anyhow!("replicate panicked: {}", panic_message(payload.as_ref())))??;
    let artifact = ResultsArtifact {
        job_id: id,
        completed_at: Utc::now().to_rfc3339(),
        model: &config.model,
        nloci: config.nloci,
        tables: &tables,
    };
    let path = results_path(&config.datafile, id);
    atomic_write_json_pretty(&path, &artifact)
        .with_context(|| format!("writing results of replicate {id}"))?;
    Ok(path)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

pub fn run_array(config: &BatchConfig) -> Result<BatchSummary> {
    info!(
        task_id = config.task_id.as_deref().unwrap_or("-"),
        model = %config.model,
        nloci = config.nloci,
        "task starting work"
    );
    let mut replicate = StudyReplicate::new(&config.model, config.nloci)?;
    run_batch(config, &mut replicate)
}
