use anyhow::{anyhow, Context, Result};
use cgp_model::{library, Model, ModelError, Override, SolverStatus, Trajectory};
use cgp_runner::{BatchConfig, BatchSummary, JobConfig, JobCoordinator, JobError, LeaseStatus};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cgp", version, about = "cGP simulation toolbox")]
struct Cli {
    /// Log verbosity (trace, debug, info, warn, error); RUST_LOG applies otherwise
    #[arg(long, global = true)]
    log_level: Option<tracing::Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work through the job set as one array task
    Array {
        /// JSON settings file; the process environment is used otherwise
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Lease the next job id
    Acquire {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Mark a leased job id as finished
    Release {
        id: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show issued, leased, failed and redone job ids
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Integrate a built-in model and print its trajectory
    Integrate {
        /// One of the built-in model names
        model: String,
        #[arg(long, default_value_t = 0.0)]
        t0: f64,
        #[arg(long, default_value_t = 10.0)]
        t1: f64,
        /// Report this many evenly spaced times instead of every step
        #[arg(long)]
        points: Option<usize>,
        /// Temporary value for a state or parameter field, as name=value
        #[arg(long = "set")]
        set_values: Vec<String>,
        /// Hold a state field fixed, as name=value
        #[arg(long = "clamp")]
        clamp_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{err:#}"), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(job) = err.downcast_ref::<JobError>() {
        return job.code();
    }
    if let Some(model) = err.downcast_ref::<ModelError>() {
        return model.code();
    }
    "command_failed"
}

fn init_tracing(level: Option<tracing::Level>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level.as_str().to_ascii_lowercase()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Array { config, json } => {
            let config = load_batch_config(config.as_deref())?;
            if let Some(dir) = &config.workdir {
                std::env::set_current_dir(dir)
                    .with_context(|| format!("changing to submit directory {}", dir.display()))?;
            }
            let summary = cgp_runner::run_array(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "array",
                    "task_id": config.task_id,
                    "summary": summary_to_json(&summary),
                })));
            }
            print_batch_summary(&summary);
        }
        Commands::Acquire { config, json } => {
            let coordinator = JobCoordinator::new(load_job_config(config.as_deref())?)?;
            let grant = coordinator.acquire_grant()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "acquire",
                    "grant": grant,
                    "done": !grant.is_work(),
                })));
            }
            println!("{}", grant.id);
        }
        Commands::Release { id, config, json } => {
            let coordinator = JobCoordinator::new(load_job_config(config.as_deref())?)?;
            coordinator.release(id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "release",
                    "id": id,
                })));
            }
            println!("released: {}", id);
        }
        Commands::Status { config, json } => {
            let coordinator = JobCoordinator::new(load_job_config(config.as_deref())?)?;
            let status = coordinator.status()?;
            let complete = status.is_complete();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "status": status,
                    "complete": complete,
                })));
            }
            print_status(&status);
        }
        Commands::Integrate {
            model,
            t0,
            t1,
            points,
            set_values,
            clamp_values,
            json,
        } => {
            let mut model = library::by_name(&model)?;
            let times = time_grid(t0, t1, points)?;
            let overrides = parse_assignments("--set", &set_values)?;
            let clamps = parse_assignments("--clamp", &clamp_values)?;
            let traj = integrate_with(&mut model, &times, overrides, &clamps)?;
            let fields: Vec<&str> = model.state().layout().names().collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "integrate",
                    "model": model.name(),
                    "fields": fields,
                    "trajectory": traj,
                })));
            }
            print_trajectory(&fields, &traj);
        }
    }
    Ok(None)
}

fn load_batch_config(path: Option<&Path>) -> Result<BatchConfig> {
    Ok(match path {
        Some(path) => BatchConfig::from_json_file(path)?,
        None => BatchConfig::from_env()?,
    })
}

fn load_job_config(path: Option<&Path>) -> Result<JobConfig> {
    Ok(match path {
        Some(path) => JobConfig::from_json_file(path)?,
        None => JobConfig::from_env()?,
    })
}

fn time_grid(t0: f64, t1: f64, points: Option<usize>) -> Result<Vec<f64>> {
    match points {
        None => Ok(vec![t0, t1]),
        Some(n) if n >= 2 => {
            let dt = (t1 - t0) / (n - 1) as f64;
            let mut times: Vec<f64> = (0..n).map(|i| t0 + dt * i as f64).collect();
            times[n - 1] = t1;
            Ok(times)
        }
        Some(n) => Err(anyhow!("--points must be at least 2, got {}", n)),
    }
}

fn integrate_with(
    model: &mut Model,
    times: &[f64],
    overrides: Vec<(String, f64)>,
    clamps: &[(String, f64)],
) -> Result<Trajectory> {
    let ov = overrides
        .into_iter()
        .fold(Override::new(), |ov, (name, value)| ov.set(name, value));
    let traj = model.with_override(ov, |m| -> Result<Trajectory> {
        if clamps.is_empty() {
            return Ok(m.integrate(times)?);
        }
        let fixed: Vec<(&str, f64)> = clamps.iter().map(|(n, v)| (n.as_str(), *v)).collect();
        let mut clamped = m.clamp(&fixed)?;
        Ok(clamped.integrate(times)?)
    })?;
    if let SolverStatus::RhsFailure { t, message } = &traj.status {
        tracing::warn!(t, message = %message, "integration stopped early");
    }
    Ok(traj)
}

fn parse_assignments(flag: &str, values: &[String]) -> Result<Vec<(String, f64)>> {
    let mut out = Vec::new();
    for raw in values {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid {} '{}': expected name=value", flag, raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid {} '{}': name cannot be empty", flag, raw));
        }
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("invalid {} '{}': value is not a number", flag, raw))?;
        out.push((key.trim().to_string(), value));
    }
    Ok(out)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Array { json, .. }
        | Commands::Acquire { json, .. }
        | Commands::Release { json, .. }
        | Commands::Status { json, .. }
        | Commands::Integrate { json, .. } => *json,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn summary_to_json(summary: &BatchSummary) -> Value {
    json!({
        "completed": summary.completed,
        "failed": summary.failed,
        "redone": summary.redone,
        "stopped_early": summary.stopped_early,
    })
}

fn print_batch_summary(summary: &BatchSummary) {
    println!("completed: {:?}", summary.completed);
    println!("failed: {:?}", summary.failed);
    println!("redone: {:?}", summary.redone);
    if summary.stopped_early {
        println!("stopped_early: true");
    }
}

fn print_status(status: &LeaseStatus) {
    println!("nsims: {}", status.nsims);
    println!("issued: {}", status.issued);
    println!("leased: {:?}", status.leased);
    println!("errored: {:?}", status.errored);
    println!("redone: {:?}", status.redone);
    println!("complete: {}", status.is_complete());
}

fn print_trajectory(fields: &[&str], traj: &Trajectory) {
    println!("t\t{}", fields.join("\t"));
    for (t, y) in traj.t.iter().zip(&traj.y) {
        let row: Vec<String> = y.iter().map(|v| format!("{:.6}", v)).collect();
        println!("{:.6}\t{}", t, row.join("\t"));
    }
    if !traj.status.is_ok() {
        println!("# status: {:?}", traj.status);
    }
}
