//! Command-line interface for gantry.
//!
//! Provides commands for running pipelines, checking run status, listing
//! and resuming runs, validating definitions, and pruning old run state.
//!
//! Exit codes for `run`:
//! - 0: all jobs succeeded
//! - 1: at least one job failed (or the engine errored)
//! - 2: definition error (parse failure, cycle, unknown reference)
//! - 3: trigger filters did not match (run never started)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::config;
use crate::core::{
    preflight, ArtifactStore, EventStore, JobExecutor, Pipeline, Scheduler,
};
use crate::domain::{JobStatus, Run, RunState, TriggerContext};
use crate::runners::ShellRunner;

/// gantry - Event-sourced CI pipeline orchestration engine
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Path to the pipeline YAML file
        pipeline_file: PathBuf,

        /// Trigger event type
        #[arg(short, long, default_value = "manual")]
        event: String,

        /// Branch the run is for
        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Commit SHA being built
        #[arg(long, default_value = "HEAD")]
        commit: String,

        /// Who triggered the run
        #[arg(long, default_value = "local")]
        actor: String,

        /// Maximum jobs running in parallel (defaults from config)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Resume a failed or cancelled run
    Resume {
        /// Run ID to resume
        run_id: String,

        /// Path to the pipeline YAML file
        pipeline_file: PathBuf,

        /// Maximum jobs running in parallel (defaults from config)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Parse a pipeline file and check its dependency graph
    Validate {
        /// Path to the pipeline YAML file
        pipeline_file: PathBuf,
    },

    /// Delete run state older than the retention window
    Gc {
        /// Retention window in days (defaults from config)
        #[arg(long)]
        retention_days: Option<u64>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Run {
                pipeline_file,
                event,
                branch,
                commit,
                actor,
                concurrency,
            } => {
                let trigger = TriggerContext::new(event, branch, commit, actor);
                run_pipeline(&pipeline_file, trigger, concurrency).await
            }
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Resume {
                run_id,
                pipeline_file,
                concurrency,
            } => resume_run(&run_id, &pipeline_file, concurrency).await,
            Commands::Validate { pipeline_file } => validate(&pipeline_file),
            Commands::Gc { retention_days } => gc(retention_days).await,
            Commands::Config => show_config(),
        }
    }
}

/// Build the executor stack shared by `run` and `resume`
fn build_scheduler(pipeline: &Pipeline, concurrency: Option<usize>) -> Result<Scheduler> {
    let concurrency = match concurrency {
        Some(n) => n,
        None => config::config()?.engine.concurrency,
    };

    let executor = JobExecutor::new(
        Arc::new(ShellRunner::new()),
        Arc::new(ArtifactStore::open_default()?),
        pipeline.limits.clone(),
    );

    Ok(Scheduler::new(Arc::new(executor), concurrency))
}

/// Cancel channel fed by ctrl-c
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested, draining running jobs");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_pipeline(
    pipeline_file: &PathBuf,
    trigger: TriggerContext,
    concurrency: Option<usize>,
) -> Result<ExitCode> {
    let pipeline = match load_and_check(pipeline_file) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Pipeline definition error: {:#}", e);
            return Ok(ExitCode::from(2));
        }
    };

    if !pipeline.trigger.matches(&trigger) {
        println!(
            "Pipeline '{}' does not trigger on {} for branch '{}'",
            pipeline.name, trigger.event, trigger.branch
        );
        return Ok(ExitCode::from(3));
    }

    let run_id = Uuid::new_v4();
    let store = Arc::new(EventStore::open(run_id).await?);
    let scheduler = build_scheduler(&pipeline, concurrency)?;

    println!("Run {} started", run_id);
    let run = scheduler
        .run(&pipeline, trigger, store, cancel_on_ctrl_c())
        .await?;

    print_report(&run);
    Ok(exit_code_for(&run))
}

async fn resume_run(
    run_id: &str,
    pipeline_file: &PathBuf,
    concurrency: Option<usize>,
) -> Result<ExitCode> {
    let run_id = Uuid::parse_str(run_id).context("Invalid run ID (expected UUID)")?;

    let pipeline = match load_and_check(pipeline_file) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Pipeline definition error: {:#}", e);
            return Ok(ExitCode::from(2));
        }
    };

    let store = Arc::new(EventStore::open(run_id).await?);
    let scheduler = build_scheduler(&pipeline, concurrency)?;

    let run = scheduler
        .resume(&pipeline, store, cancel_on_ctrl_c())
        .await?;

    print_report(&run);
    Ok(exit_code_for(&run))
}

fn load_and_check(pipeline_file: &PathBuf) -> Result<Pipeline> {
    let pipeline = Pipeline::from_file(pipeline_file)?;
    preflight(&pipeline)?;
    Ok(pipeline)
}

fn validate(pipeline_file: &PathBuf) -> Result<ExitCode> {
    match load_and_check(pipeline_file) {
        Ok(pipeline) => {
            println!(
                "Pipeline '{}' is valid ({} jobs)",
                pipeline.name,
                pipeline.jobs.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Pipeline definition error: {:#}", e);
            Ok(ExitCode::from(2))
        }
    }
}

async fn show_status(run_id: &str) -> Result<ExitCode> {
    let run_id = Uuid::parse_str(run_id).context("Invalid run ID (expected UUID)")?;

    let store = EventStore::open_readonly(run_id).await?;
    let events = store.replay().await?;
    let mut run = Run::from_events(&events)
        .with_context(|| format!("No events recorded for run {}", run_id))?;

    if let Some(manifest) = store.load_manifest().await? {
        run.pipeline_name = manifest.pipeline_name;
        run.trigger = manifest.trigger;
    }

    print_report(&run);
    Ok(ExitCode::SUCCESS)
}

async fn list_runs(limit: usize) -> Result<ExitCode> {
    let run_ids = EventStore::list_runs().await?;
    let mut runs = Vec::new();

    for run_id in run_ids {
        let Ok(store) = EventStore::open_readonly(run_id).await else {
            continue;
        };
        let events = store.replay().await?;
        if let Some(mut run) = Run::from_events(&events) {
            if let Some(manifest) = store.load_manifest().await? {
                run.pipeline_name = manifest.pipeline_name;
            }
            runs.push(run);
        }
    }

    // Most recent first
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);

    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(ExitCode::SUCCESS);
    }

    for run in runs {
        println!(
            "{}  {:<20}  {:<10}  {}",
            run.id,
            run.pipeline_name,
            state_label(&run.state),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn gc(retention_days: Option<u64>) -> Result<ExitCode> {
    let days = match retention_days {
        Some(days) => days,
        None => config::config()?.engine.retention_days,
    };

    let store = ArtifactStore::open_default()?;
    let removed = store
        .sweep_expired(Duration::from_secs(days * 24 * 60 * 60))
        .await?;

    println!("Removed {} run(s) older than {} day(s)", removed, days);
    Ok(ExitCode::SUCCESS)
}

fn show_config() -> Result<ExitCode> {
    let config = config::config()?;

    println!("home:            {}", config.home.display());
    println!(
        "config file:     {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("concurrency:     {}", config.engine.concurrency);
    println!("retention days:  {}", config.engine.retention_days);

    Ok(ExitCode::SUCCESS)
}

/// Print the per-job terminal report
fn print_report(run: &Run) {
    println!();
    println!(
        "Run {} ({}) - {}",
        run.id,
        run.pipeline_name,
        state_label(&run.state)
    );

    let mut job_ids: Vec<&String> = run.jobs.keys().collect();
    job_ids.sort();

    for job_id in job_ids {
        let result = &run.jobs[job_id];
        let mut line = format!("  {:<12} {}", status_label(result.status), job_id);

        if !result.outputs.is_empty() {
            let mut keys: Vec<&String> = result.outputs.keys().collect();
            keys.sort();
            let rendered: Vec<String> = keys
                .iter()
                .map(|k| format!("{}={}", k, result.outputs[*k]))
                .collect();
            line.push_str(&format!("  [{}]", rendered.join(", ")));
        }
        println!("{}", line);

        if result.status == JobStatus::Failed {
            if let Some(code) = result.exit_code {
                println!("               exit code {}", code);
            }
            if let Some(error) = &result.error {
                for err_line in error.lines() {
                    println!("               | {}", err_line);
                }
            }
        }
    }
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Failed { .. } => "failed",
        RunState::Cancelled => "cancelled",
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Succeeded => "succeeded",
        JobStatus::Failed => "failed",
        JobStatus::Skipped => "skipped",
    }
}

fn exit_code_for(run: &Run) -> ExitCode {
    match run.state {
        RunState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["gantry", "run", "ci.yaml"]);
        match cli.command {
            Commands::Run { event, branch, .. } => {
                assert_eq!(event, "manual");
                assert_eq!(branch, "main");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::parse_from([
            "gantry", "run", "ci.yaml", "--event", "push", "--branch", "release/2",
            "--concurrency", "2",
        ]);
        match cli.command {
            Commands::Run {
                event,
                branch,
                concurrency,
                ..
            } => {
                assert_eq!(event, "push");
                assert_eq!(branch, "release/2");
                assert_eq!(concurrency, Some(2));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
