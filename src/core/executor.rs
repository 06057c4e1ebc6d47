//! Job execution: drives one job's steps in an isolated workspace.
//!
//! The executor provisions a fresh temporary workspace, copies fetched
//! artifacts into it, runs the job's steps strictly in order, and collects
//! declared outputs and artifacts at the end. Teardown is RAII: the
//! workspace is removed on every exit path, including cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tempfile::TempDir;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::{ArtifactHandle, ArtifactMeta, Event, EventType};
use crate::runners::{ExecError, Runner, StepRequest};

use super::artifact_store::{ArtifactError, ArtifactStore};
use super::event_store::EventStore;
use super::limits::RunLimits;
use super::pipeline::{ArtifactDecl, RetryPolicy};

/// A fully resolved job, ready to execute.
///
/// Step commands and environments have been interpolated by the scheduler
/// before dispatch; the executor never consults the output registry.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub run_id: Uuid,
    pub job_id: String,

    /// Resolved steps plus their retry/best-effort policy
    pub steps: Vec<ResolvedStep>,

    /// Artifacts to copy into the workspace before the first step
    pub fetches: Vec<ArtifactHandle>,

    /// Artifacts to collect from the workspace on success
    pub artifacts: Vec<ArtifactDecl>,

    /// Output keys the job publishes (undeclared keys are dropped)
    pub declared_outputs: Vec<String>,
}

/// One resolved step
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub request: StepRequest,
    pub best_effort: bool,
    pub retry_policy: RetryPolicy,
}

/// Terminal report for one job execution
#[derive(Debug, Clone)]
pub struct JobReport {
    pub success: bool,

    /// Published outputs (declared keys only)
    pub outputs: HashMap<String, String>,

    /// Metadata of stored artifacts
    pub artifacts: Vec<ArtifactMeta>,

    /// Exit code of the failing step, if any
    pub exit_code: Option<i32>,

    /// Failure description (failing step's stderr tail)
    pub error: Option<String>,

    pub duration_ms: u64,
}

/// Executes single jobs against a Runner
pub struct JobExecutor {
    runner: Arc<dyn Runner>,
    artifacts: Arc<ArtifactStore>,
    limits: RunLimits,
}

impl JobExecutor {
    pub fn new(runner: Arc<dyn Runner>, artifacts: Arc<ArtifactStore>, limits: RunLimits) -> Self {
        Self {
            runner,
            artifacts,
            limits,
        }
    }

    /// Execute one job to completion (or failure/cancellation).
    ///
    /// Step-level events are appended to the store as they happen; the
    /// job-level terminal event is the scheduler's responsibility.
    pub async fn execute(
        &self,
        request: JobRequest,
        store: &EventStore,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<JobReport, ExecError> {
        let job_start = Instant::now();

        let workspace = TempDir::with_prefix(format!("gantry-{}-", request.job_id))
            .map_err(|e| ExecError::Provision(e.to_string()))?;

        self.stage_fetches(&request, workspace.path()).await?;

        let mut published: HashMap<String, String> = HashMap::new();

        for step in &request.steps {
            if *cancel.borrow() {
                return Err(ExecError::Cancelled {
                    step: step.request.name.clone(),
                });
            }

            match self
                .run_step(&request, step, workspace.path(), store, &mut cancel)
                .await?
            {
                StepVerdict::Completed(outputs) => {
                    published.extend(outputs);
                }
                StepVerdict::BestEffortFailed => {
                    // Recorded in the event log; the job carries on
                }
                StepVerdict::Failed {
                    exit_code,
                    stderr_tail,
                } => {
                    return Ok(JobReport {
                        success: false,
                        outputs: HashMap::new(),
                        artifacts: Vec::new(),
                        exit_code: Some(exit_code),
                        error: Some(stderr_tail),
                        duration_ms: job_start.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        let artifacts = match self.collect_artifacts(&request, workspace.path()).await {
            Ok(metas) => metas,
            Err(e) => {
                error!(job = %request.job_id, error = %e, "Artifact collection failed");
                return Ok(JobReport {
                    success: false,
                    outputs: HashMap::new(),
                    artifacts: Vec::new(),
                    exit_code: None,
                    error: Some(format!("artifact collection failed: {}", e)),
                    duration_ms: job_start.elapsed().as_millis() as u64,
                });
            }
        };

        // Only declared keys propagate downstream
        let outputs: HashMap<String, String> = published
            .into_iter()
            .filter(|(key, _)| request.declared_outputs.contains(key))
            .collect();

        Ok(JobReport {
            success: true,
            outputs,
            artifacts,
            exit_code: None,
            error: None,
            duration_ms: job_start.elapsed().as_millis() as u64,
        })
    }

    /// Copy fetched artifacts into the workspace under their artifact names
    async fn stage_fetches(
        &self,
        request: &JobRequest,
        workdir: &std::path::Path,
    ) -> Result<(), ExecError> {
        for handle in &request.fetches {
            let content = self.artifacts.get(handle).await.map_err(|e| match e {
                ArtifactError::NotFound { handle } => ExecError::Provision(format!(
                    "artifact {} was never produced",
                    handle
                )),
                other => ExecError::Provision(other.to_string()),
            })?;

            tokio::fs::write(workdir.join(&handle.name), content)
                .await
                .map_err(|e| ExecError::Provision(format!("failed to stage artifact: {}", e)))?;
        }
        Ok(())
    }

    /// Run one step with its retry policy
    async fn run_step(
        &self,
        request: &JobRequest,
        step: &ResolvedStep,
        workdir: &std::path::Path,
        store: &EventStore,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<StepVerdict, ExecError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let step_start = Instant::now();

            store
                .append(&Event::step_level(
                    request.run_id,
                    &request.job_id,
                    &step.request.name,
                    EventType::StepStarted,
                    format!("Step '{}' attempt {}", step.request.name, attempt),
                ))
                .await
                .map_err(|e| ExecError::Capture {
                    step: step.request.name.clone(),
                    reason: e.to_string(),
                })?;

            let invocation = self.runner.invoke(&step.request, workdir, cancel).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            let failure = match invocation {
                Ok(inv) if inv.success() => {
                    let captured = (inv.stdout.len() + inv.stderr.len()) as u64;
                    if let Err(violation) = self.limits.check_capture(captured) {
                        return Ok(StepVerdict::Failed {
                            exit_code: inv.exit_code,
                            stderr_tail: violation.to_string(),
                        });
                    }

                    store
                        .append(
                            &Event::step_level(
                                request.run_id,
                                &request.job_id,
                                &step.request.name,
                                EventType::StepCompleted,
                                format!(
                                    "Step '{}' completed in {}ms",
                                    step.request.name, duration_ms
                                ),
                            )
                            .with_duration(duration_ms),
                        )
                        .await
                        .ok();

                    debug!(job = %request.job_id, step = %step.request.name, "Step completed");
                    return Ok(StepVerdict::Completed(inv.outputs));
                }
                Ok(inv) => (inv.exit_code, tail(&inv.stderr)),
                Err(ExecError::Cancelled { step }) => {
                    return Err(ExecError::Cancelled { step })
                }
                Err(e) => (-1, e.to_string()),
            };

            let (exit_code, stderr_tail) = failure;

            if step.retry_policy.should_retry(attempt) {
                let delay = step.retry_policy.delay_for_attempt(attempt);

                store
                    .append(
                        &Event::step_level(
                            request.run_id,
                            &request.job_id,
                            &step.request.name,
                            EventType::StepRetrying,
                            format!(
                                "Step '{}' failed (exit {}), retrying in {:?}",
                                step.request.name, exit_code, delay
                            ),
                        )
                        .with_exit_code(exit_code)
                        .with_error(stderr_tail.clone()),
                    )
                    .await
                    .ok();

                warn!(
                    job = %request.job_id,
                    step = %step.request.name,
                    attempt,
                    exit_code,
                    "Step failed, retrying"
                );

                tokio::time::sleep(delay).await;
                continue;
            }

            store
                .append(
                    &Event::step_level(
                        request.run_id,
                        &request.job_id,
                        &step.request.name,
                        EventType::StepFailed,
                        format!(
                            "Step '{}' failed after {} attempt(s) with exit {}{}",
                            step.request.name,
                            attempt,
                            exit_code,
                            if step.best_effort { " (best effort)" } else { "" }
                        ),
                    )
                    .with_exit_code(exit_code)
                    .with_duration(duration_ms)
                    .with_error(stderr_tail.clone()),
                )
                .await
                .ok();

            if step.best_effort {
                warn!(
                    job = %request.job_id,
                    step = %step.request.name,
                    exit_code,
                    "Best-effort step failed, continuing"
                );
                return Ok(StepVerdict::BestEffortFailed);
            }

            return Ok(StepVerdict::Failed {
                exit_code,
                stderr_tail,
            });
        }
    }

    /// Read declared artifact files out of the workspace into the store
    async fn collect_artifacts(
        &self,
        request: &JobRequest,
        workdir: &std::path::Path,
    ) -> Result<Vec<ArtifactMeta>, ArtifactError> {
        let mut metas = Vec::new();

        for decl in &request.artifacts {
            let source = workdir.join(&decl.path);
            let content = tokio::fs::read(&source).await.map_err(|e| {
                ArtifactError::CorruptMeta {
                    handle: ArtifactHandle::new(request.run_id, &request.job_id, &decl.name),
                    reason: format!("declared path '{}' unreadable: {}", decl.path, e),
                }
            })?;

            let handle = ArtifactHandle::new(request.run_id, &request.job_id, &decl.name);
            metas.push(self.artifacts.put(handle, &content).await?);
        }

        Ok(metas)
    }
}

enum StepVerdict {
    Completed(HashMap<String, String>),
    BestEffortFailed,
    Failed { exit_code: i32, stderr_tail: String },
}

/// Last few lines of captured stderr, for failure reports
fn tail(stderr: &str) -> String {
    const MAX_LINES: usize = 20;
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(MAX_LINES);
    lines[start..].join("\n")
}
