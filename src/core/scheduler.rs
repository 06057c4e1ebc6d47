//! Run scheduling: drives a pipeline DAG to completion.
//!
//! The dispatch loop is the single serialization point for job state. It
//! seeds jobs whose dependency count is zero, evaluates each ready job's
//! gate, dispatches admitted jobs to the executor (bounded by a semaphore),
//! and processes completions one at a time from a channel. Failures
//! propagate to transitive dependents as skips; cancellation and the
//! run-level timeout drain in-flight jobs and skip the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    ArtifactHandle, Event, EventType, JobResult, JobStatus, Run, RunManifest, RunState,
    TriggerContext,
};
use crate::runners::ExecError;

use super::condition::{Condition, UpstreamOutcome};
use super::event_store::EventStore;
use super::executor::{JobExecutor, JobReport, JobRequest, ResolvedStep};
use super::graph::JobGraph;
use super::limits::RunTracker;
use super::outputs::{interpolate, OutputError, OutputRegistry};
use super::pipeline::{Job, Pipeline};
use crate::runners::StepRequest;

/// Build-time checks a pipeline must pass before a run is created.
///
/// Shape validation, graph construction (cycles, unknown references), the
/// job-count limit, and gate-condition parsing. Everything caught here is a
/// definition error: the run never starts.
pub fn preflight(pipeline: &Pipeline) -> Result<JobGraph> {
    pipeline.validate()?;

    let graph = JobGraph::build(pipeline)?;
    pipeline.limits.check_job_count(graph.len())?;

    for job_id in pipeline.job_ids() {
        if let Some(expr) = &pipeline.jobs[job_id].condition {
            Condition::parse(expr)
                .with_context(|| format!("Invalid condition on job '{}'", job_id))?;
        }
    }

    Ok(graph)
}

/// Drives runs of a pipeline against a job executor
pub struct Scheduler {
    executor: Arc<JobExecutor>,
    concurrency: usize,
}

impl Scheduler {
    /// Create a scheduler with a concurrency limit (parallel jobs)
    pub fn new(executor: Arc<JobExecutor>, concurrency: usize) -> Self {
        Self {
            executor,
            concurrency: concurrency.max(1),
        }
    }

    /// Execute a fresh run of a pipeline.
    #[instrument(skip(self, pipeline, trigger, store, cancel), fields(pipeline = %pipeline.name, run_id = %store.run_id()))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        trigger: TriggerContext,
        store: Arc<EventStore>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Run> {
        let manifest = RunManifest::new(store.run_id(), pipeline.name.clone(), trigger.clone());
        store.store_manifest(&manifest).await?;

        self.drive(pipeline, trigger, store, cancel, HashMap::new())
            .await
    }

    /// Resume a previously failed or cancelled run.
    ///
    /// Jobs that already succeeded are seeded from the event log, with
    /// their recorded outputs and artifact handles; everything else is
    /// scheduled again.
    #[instrument(skip(self, pipeline, store, cancel), fields(pipeline = %pipeline.name, run_id = %store.run_id()))]
    pub async fn resume(
        &self,
        pipeline: &Pipeline,
        store: Arc<EventStore>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Run> {
        let events = store.replay().await?;
        if events.is_empty() {
            anyhow::bail!("No events found for run {}", store.run_id());
        }

        let prior = Run::from_events(&events).context("Failed to reconstruct run state")?;
        if prior.state == RunState::Completed {
            anyhow::bail!("Run {} already completed", store.run_id());
        }

        let trigger = store
            .load_manifest()
            .await?
            .map(|m| m.trigger)
            .unwrap_or_else(|| prior.trigger.clone());

        let seeded: HashMap<String, JobResult> = prior
            .jobs
            .into_iter()
            .filter(|(job_id, result)| result.succeeded() && pipeline.jobs.contains_key(job_id))
            .collect();

        info!(seeded = seeded.len(), "Resuming run");

        self.drive(pipeline, trigger, store, cancel, seeded).await
    }

    async fn drive(
        &self,
        pipeline: &Pipeline,
        trigger: TriggerContext,
        store: Arc<EventStore>,
        mut external_cancel: watch::Receiver<bool>,
        seeded: HashMap<String, JobResult>,
    ) -> Result<Run> {
        let graph = preflight(pipeline)?;
        let run_id = store.run_id();

        let mut gates: HashMap<String, Condition> = HashMap::new();
        for job_id in pipeline.job_ids() {
            let gate = match &pipeline.jobs[job_id].condition {
                Some(expr) => Condition::parse(expr)
                    .with_context(|| format!("Invalid condition on job '{}'", job_id))?
                    .into_gate(),
                None => Condition::default_gate(),
            };
            gates.insert(job_id.to_string(), gate);
        }

        let order: Vec<String> = pipeline.job_ids().iter().map(|s| s.to_string()).collect();
        let mut remaining = graph.indegrees();
        let mut registry = OutputRegistry::new();
        let mut run = Run::new(run_id, pipeline.name.clone(), trigger.clone());
        let mut tracker = RunTracker::new();

        // Seed results carried over from a previous attempt
        for (job_id, result) in seeded {
            registry.finalize(&job_id, result.status, result.outputs.clone());
            for dependent in graph.dependents_of(&job_id) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                }
            }
            debug!(job = %job_id, "Seeded from previous attempt");
            run.jobs.insert(job_id, result);
        }

        store
            .append(&Event::run_level(
                run_id,
                EventType::RunStarted,
                format!(
                    "pipeline '{}' started ({} on {})",
                    pipeline.name, trigger.event, trigger.branch
                ),
            ))
            .await?;
        info!("Run started");

        // Internal cancel fans out to executors; fed by the external signal
        // and by the run-level timeout.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        {
            let cancel_tx = Arc::clone(&cancel_tx);
            tokio::spawn(async move {
                crate::runners::wait_cancelled(&mut external_cancel).await;
                let _ = cancel_tx.send(true);
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::channel::<(String, Result<JobReport, ExecError>)>(
            graph.len().max(1),
        );
        let mut handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        let mut limit_failure: Option<String> = None;

        loop {
            // Run-level timeout: observed between dispatch cycles
            if limit_failure.is_none() {
                if let Err(violation) = pipeline.limits.check_elapsed(&tracker) {
                    let message = violation.to_string();
                    error!(%message, "Run limit reached");
                    store
                        .append(
                            &Event::run_level(run_id, EventType::LimitReached, message.clone())
                                .with_error(message.clone()),
                        )
                        .await?;
                    limit_failure = Some(message);
                    let _ = cancel_tx.send(true);
                }
            }

            let halting = *cancel_rx.borrow();

            // Dispatch phase: loop to a fixpoint since each skip can ready
            // further dependents.
            loop {
                let mut progressed = false;

                for job_id in &order {
                    if run.jobs.contains_key(job_id) {
                        continue;
                    }
                    if remaining[job_id] > 0 {
                        continue;
                    }

                    let job = &pipeline.jobs[job_id];

                    if halting {
                        self.finalize_skip(
                            &store,
                            &mut run,
                            &mut registry,
                            &graph,
                            &mut remaining,
                            job_id,
                            "run halted before dispatch",
                        )
                        .await?;
                        progressed = true;
                        continue;
                    }

                    let outcome = upstream_outcome(pipeline, &graph, &run, job_id);
                    if !gates[job_id].evaluate(&trigger, outcome) {
                        let reason = if outcome.all_succeeded {
                            "condition evaluated to false"
                        } else {
                            "upstream dependency did not succeed"
                        };
                        self.finalize_skip(
                            &store,
                            &mut run,
                            &mut registry,
                            &graph,
                            &mut remaining,
                            job_id,
                            reason,
                        )
                        .await?;
                        progressed = true;
                        continue;
                    }

                    match build_request(run_id, job_id, job, pipeline, &trigger, &registry) {
                        Ok(request) => {
                            let handle = self
                                .dispatch(request, &store, &mut run, &semaphore, &tx, &cancel_rx)
                                .await?;
                            handles.push(handle);
                            tracker.record_dispatch();
                            progressed = true;
                        }
                        Err(OutputError::NotReady { job_id, key }) => {
                            // Dispatch ordering guarantees finalized producers;
                            // reaching this is an engine bug, not a job failure.
                            anyhow::bail!(
                                "scheduler dispatched a consumer of '{}.{}' before its producer finalized",
                                job_id,
                                key
                            );
                        }
                        Err(e) => {
                            self.finalize_fail(
                                &store,
                                &mut run,
                                &mut registry,
                                &graph,
                                &mut remaining,
                                job_id,
                                None,
                                e.to_string(),
                            )
                            .await?;
                            progressed = true;
                        }
                    }
                }

                if !progressed {
                    break;
                }
            }

            // Terminal when every job has a terminal result
            if run.jobs.len() == graph.len()
                && run.jobs.values().all(|r| r.status.is_terminal())
            {
                break;
            }

            // At least one job is running; block for its completion, waking
            // at the run deadline so the timeout can cancel stuck jobs.
            let until_deadline = Duration::from_secs(
                pipeline
                    .limits
                    .run_timeout_seconds
                    .saturating_sub(tracker.elapsed_seconds())
                    .max(1),
            );
            let completion = tokio::select! {
                completion = rx.recv() => completion,
                _ = tokio::time::sleep(until_deadline), if limit_failure.is_none() => continue,
            };
            let Some((job_id, result)) = completion else {
                anyhow::bail!("completion channel closed with jobs outstanding");
            };

            match result {
                Ok(report) if report.success => {
                    self.finalize_success(
                        &store,
                        &mut run,
                        &mut registry,
                        &graph,
                        &mut remaining,
                        &job_id,
                        report,
                    )
                    .await?;
                }
                Ok(report) => {
                    self.finalize_fail(
                        &store,
                        &mut run,
                        &mut registry,
                        &graph,
                        &mut remaining,
                        &job_id,
                        report.exit_code,
                        report.error.unwrap_or_else(|| "step failed".to_string()),
                    )
                    .await?;
                }
                Err(ExecError::Cancelled { .. }) => {
                    self.finalize_skip(
                        &store,
                        &mut run,
                        &mut registry,
                        &graph,
                        &mut remaining,
                        &job_id,
                        "cancelled while running",
                    )
                    .await?;
                }
                Err(e) => {
                    self.finalize_fail(
                        &store,
                        &mut run,
                        &mut registry,
                        &graph,
                        &mut remaining,
                        &job_id,
                        None,
                        e.to_string(),
                    )
                    .await?;
                }
            }
        }

        // Every job is terminal, so the tasks are done; joining them releases
        // their store handles (and with them the run-dir lock) before return.
        for handle in handles {
            let _ = handle.await;
        }

        self.complete_run(&store, &mut run, limit_failure).await?;
        Ok(run)
    }

    /// Spawn a ready job onto the executor
    async fn dispatch(
        &self,
        request: JobRequest,
        store: &Arc<EventStore>,
        run: &mut Run,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::Sender<(String, Result<JobReport, ExecError>)>,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let job_id = request.job_id.clone();

        store
            .append(&Event::job_level(
                run.id,
                &job_id,
                EventType::JobStarted,
                format!("Job '{}' dispatched", job_id),
            ))
            .await?;
        info!(job = %job_id, "Job dispatched");

        run.jobs.insert(
            job_id.clone(),
            JobResult {
                status: JobStatus::Running,
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        );

        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(store);
        let semaphore = Arc::clone(semaphore);
        let tx = tx.clone();
        let cancel = cancel_rx.clone();

        let handle = tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let result = executor.execute(request, &store, cancel).await;
            drop(permit);
            let _ = tx.send((job_id, result)).await;
        });

        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_success(
        &self,
        store: &EventStore,
        run: &mut Run,
        registry: &mut OutputRegistry,
        graph: &JobGraph,
        remaining: &mut HashMap<String, usize>,
        job_id: &str,
        report: JobReport,
    ) -> Result<()> {
        info!(job = %job_id, duration_ms = report.duration_ms, "Job succeeded");

        store
            .append(
                &Event::job_level(
                    run.id,
                    job_id,
                    EventType::JobSucceeded,
                    format!("Job '{}' succeeded in {}ms", job_id, report.duration_ms),
                )
                .with_outputs(report.outputs.clone())
                .with_artifacts(
                    report
                        .artifacts
                        .iter()
                        .map(|m| m.handle.name.clone())
                        .collect(),
                )
                .with_duration(report.duration_ms),
            )
            .await?;

        let entry = run.jobs.entry(job_id.to_string()).or_default();
        entry.status = JobStatus::Succeeded;
        entry.outputs = report.outputs.clone();
        entry.artifacts = report.artifacts.iter().map(|m| m.handle.clone()).collect();
        entry.finished_at = Some(Utc::now());

        registry.finalize(job_id, JobStatus::Succeeded, report.outputs);
        decrement_dependents(graph, remaining, job_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_fail(
        &self,
        store: &EventStore,
        run: &mut Run,
        registry: &mut OutputRegistry,
        graph: &JobGraph,
        remaining: &mut HashMap<String, usize>,
        job_id: &str,
        exit_code: Option<i32>,
        error: String,
    ) -> Result<()> {
        error!(job = %job_id, %error, "Job failed");

        let mut event = Event::job_level(
            run.id,
            job_id,
            EventType::JobFailed,
            format!("Job '{}' failed", job_id),
        )
        .with_error(error.clone());
        if let Some(code) = exit_code {
            event = event.with_exit_code(code);
        }
        store.append(&event).await?;

        let entry = run.jobs.entry(job_id.to_string()).or_default();
        entry.status = JobStatus::Failed;
        entry.exit_code = exit_code;
        entry.error = Some(error);
        entry.finished_at = Some(Utc::now());

        registry.finalize(job_id, JobStatus::Failed, HashMap::new());
        decrement_dependents(graph, remaining, job_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_skip(
        &self,
        store: &EventStore,
        run: &mut Run,
        registry: &mut OutputRegistry,
        graph: &JobGraph,
        remaining: &mut HashMap<String, usize>,
        job_id: &str,
        reason: &str,
    ) -> Result<()> {
        warn!(job = %job_id, reason, "Job skipped");

        store
            .append(
                &Event::job_level(
                    run.id,
                    job_id,
                    EventType::JobSkipped,
                    format!("Job '{}' skipped: {}", job_id, reason),
                )
                .with_error(reason.to_string()),
            )
            .await?;

        let entry = run.jobs.entry(job_id.to_string()).or_default();
        entry.status = JobStatus::Skipped;
        entry.error = Some(reason.to_string());
        entry.finished_at = Some(Utc::now());

        registry.finalize(job_id, JobStatus::Skipped, HashMap::new());
        decrement_dependents(graph, remaining, job_id);
        Ok(())
    }

    /// Append the run-level terminal event and set the final state
    async fn complete_run(
        &self,
        store: &EventStore,
        run: &mut Run,
        limit_failure: Option<String>,
    ) -> Result<Run> {
        run.completed_at = Some(Utc::now());

        let failed_jobs = run
            .jobs
            .values()
            .filter(|r| r.status == JobStatus::Failed)
            .count();

        let event = if let Some(limit) = limit_failure {
            run.state = RunState::Failed {
                error: limit.clone(),
            };
            Event::run_level(run.id, EventType::RunFailed, "Run failed: limit reached")
                .with_error(limit)
        } else if failed_jobs > 0 {
            let error = format!("{} job(s) failed", failed_jobs);
            run.state = RunState::Failed {
                error: error.clone(),
            };
            Event::run_level(run.id, EventType::RunFailed, "Run failed").with_error(error)
        } else if run
            .jobs
            .values()
            .any(|r| r.status == JobStatus::Skipped && r.error.as_deref() == Some("cancelled while running"))
            || run
                .jobs
                .values()
                .any(|r| r.error.as_deref() == Some("run halted before dispatch"))
        {
            run.state = RunState::Cancelled;
            Event::run_level(run.id, EventType::RunCancelled, "Run cancelled")
        } else {
            run.state = RunState::Completed;
            Event::run_level(
                run.id,
                EventType::RunCompleted,
                format!("pipeline '{}' completed", run.pipeline_name),
            )
        };

        store.append(&event).await?;
        info!(state = ?run.state, "Run finished");

        Ok(run.clone())
    }
}

/// Summarize terminal dependency results for gate evaluation.
///
/// A failed dependency with `continue_on_error` is admissible: dependents
/// see it as a success, though the run itself still reports failure.
fn upstream_outcome(
    pipeline: &Pipeline,
    graph: &JobGraph,
    run: &Run,
    job_id: &str,
) -> UpstreamOutcome {
    let mut outcome = UpstreamOutcome::empty();

    for dep in graph.dependencies_of(job_id) {
        let Some(result) = run.jobs.get(dep) else {
            continue;
        };
        match result.status {
            JobStatus::Succeeded => {}
            JobStatus::Failed => {
                if pipeline.jobs[dep].continue_on_error {
                    // admissible
                } else {
                    outcome.all_succeeded = false;
                    outcome.any_failed = true;
                }
            }
            JobStatus::Skipped => {
                outcome.all_succeeded = false;
            }
            JobStatus::Pending | JobStatus::Running => {
                // Readiness requires terminal dependencies; treat as failure
                // defensively rather than dispatch on an unfinished upstream.
                outcome.all_succeeded = false;
            }
        }
    }

    outcome
}

/// Resolve a ready job into an executable request.
///
/// Interpolates step commands and env values against the output registry
/// and run metadata; the executor receives no unresolved placeholders.
fn build_request(
    run_id: Uuid,
    job_id: &str,
    job: &Job,
    pipeline: &Pipeline,
    trigger: &TriggerContext,
    registry: &OutputRegistry,
) -> Result<JobRequest, OutputError> {
    let mut steps = Vec::with_capacity(job.steps.len());

    for step in &job.steps {
        let command = interpolate(&step.run, trigger, registry)?;

        let mut env: HashMap<String, String> = HashMap::new();
        for (key, value) in job.env.iter().chain(step.env.iter()) {
            env.insert(key.clone(), interpolate(value, trigger, registry)?);
        }
        env.insert("GANTRY_RUN_ID".to_string(), run_id.to_string());
        env.insert("GANTRY_JOB".to_string(), job_id.to_string());
        env.insert("GANTRY_EVENT".to_string(), trigger.event.clone());
        env.insert("GANTRY_BRANCH".to_string(), trigger.branch.clone());
        env.insert("GANTRY_COMMIT".to_string(), trigger.commit.clone());
        env.insert("GANTRY_ACTOR".to_string(), trigger.actor.clone());

        steps.push(ResolvedStep {
            request: StepRequest {
                name: step.name.clone(),
                command,
                env,
                timeout: step.timeout(&pipeline.limits),
            },
            best_effort: step.best_effort,
            retry_policy: step.retry_policy.clone(),
        });
    }

    let fetches = job
        .fetch
        .iter()
        .map(|f| ArtifactHandle::new(run_id, &f.job, &f.artifact))
        .collect();

    Ok(JobRequest {
        run_id,
        job_id: job_id.to_string(),
        steps,
        fetches,
        artifacts: job.artifacts.clone(),
        declared_outputs: job.outputs.clone(),
    })
}

fn decrement_dependents(
    graph: &JobGraph,
    remaining: &mut HashMap<String, usize>,
    job_id: &str,
) {
    for dependent in graph.dependents_of(job_id) {
        if let Some(count) = remaining.get_mut(dependent) {
            *count -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifact_store::ArtifactStore;
    use crate::core::limits::RunLimits;
    use crate::runners::ShellRunner;
    use tempfile::TempDir;

    fn scheduler(base: &std::path::Path, concurrency: usize) -> Scheduler {
        let executor = JobExecutor::new(
            Arc::new(ShellRunner::new()),
            Arc::new(ArtifactStore::new(base)),
            RunLimits::default(),
        );
        Scheduler::new(Arc::new(executor), concurrency)
    }

    async fn run_yaml(yaml: &str) -> Run {
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        let temp = TempDir::new().unwrap();
        let store = Arc::new(
            EventStore::open_in(temp.path(), Uuid::new_v4())
                .await
                .unwrap(),
        );
        let (_cancel_tx, cancel) = watch::channel(false);
        scheduler(temp.path(), 4)
            .run(&pipeline, TriggerContext::default(), store, cancel)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_linear_pipeline_completes() {
        let run = run_yaml(
            r#"
name: linear
jobs:
  a:
    steps: [{name: s, run: "true"}]
  b:
    needs: [a]
    steps: [{name: s, run: "true"}]
"#,
        )
        .await;

        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.job_status("a"), Some(JobStatus::Succeeded));
        assert_eq!(run.job_status("b"), Some(JobStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let run = run_yaml(
            r#"
name: failing
jobs:
  a:
    steps: [{name: s, run: "exit 1"}]
  b:
    needs: [a]
    steps: [{name: s, run: "true"}]
"#,
        )
        .await;

        assert!(matches!(run.state, RunState::Failed { .. }));
        assert_eq!(run.job_status("a"), Some(JobStatus::Failed));
        assert_eq!(run.job_status("b"), Some(JobStatus::Skipped));
    }

    #[tokio::test]
    async fn test_preflight_rejects_bad_condition() {
        let pipeline = Pipeline::from_yaml(
            r#"
name: bad
jobs:
  a:
    if: "branch === 'main'"
    steps: [{name: s, run: "true"}]
"#,
        )
        .unwrap();

        assert!(preflight(&pipeline).is_err());
    }
}
