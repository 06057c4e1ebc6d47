//! Run state and reconstruction from events.
//!
//! A Run represents a single execution of a pipeline DAG.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactHandle;
use super::events::{Event, EventType, JobStatus};

/// Metadata about what triggered a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerContext {
    /// Event type that triggered the run (e.g., "push", "pull_request", "manual")
    pub event: String,

    /// Branch the run was triggered on
    pub branch: String,

    /// Commit SHA being built
    pub commit: String,

    /// Who triggered the run
    pub actor: String,
}

impl TriggerContext {
    pub fn new(
        event: impl Into<String>,
        branch: impl Into<String>,
        commit: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            event: event.into(),
            branch: branch.into(),
            commit: commit.into(),
            actor: actor.into(),
        }
    }
}

impl Default for TriggerContext {
    fn default() -> Self {
        Self::new("manual", "main", "HEAD", "local")
    }
}

/// Manifest written beside the event log when a run is created.
///
/// Carries the metadata the events themselves do not: pipeline name and
/// trigger context, needed by `status` and `resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub trigger: TriggerContext,
    pub created_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn new(run_id: Uuid, pipeline_name: impl Into<String>, trigger: TriggerContext) -> Self {
        Self {
            run_id,
            pipeline_name: pipeline_name.into(),
            trigger,
            created_at: Utc::now(),
        }
    }
}

/// The finalized (or in-flight) result of one job within a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    /// Current status
    pub status: JobStatus,

    /// Outputs published by the job (populated on success)
    pub outputs: HashMap<String, String>,

    /// Handles of artifacts stored by the job
    pub artifacts: Vec<ArtifactHandle>,

    /// Exit code of the failing step, if the job failed
    pub exit_code: Option<i32>,

    /// Stderr tail of the failing step, if the job failed
    pub error: Option<String>,

    /// When the job was dispatched
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobResult {
    /// Whether this result admits dependents: the job succeeded outright.
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the pipeline being executed
    pub pipeline_name: String,

    /// What triggered this run
    pub trigger: TriggerContext,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run completed (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Per-job results, keyed by job id (append-only: entries are never removed)
    pub jobs: HashMap<String, JobResult>,
}

impl Run {
    /// Create a new run for a pipeline
    pub fn new(id: Uuid, pipeline_name: String, trigger: TriggerContext) -> Self {
        Self {
            id,
            pipeline_name,
            trigger,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            jobs: HashMap::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self {
            id: first_event.run_id,
            pipeline_name: String::new(),
            trigger: TriggerContext::default(),
            state: RunState::Running,
            started_at: first_event.timestamp,
            completed_at: None,
            jobs: HashMap::new(),
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                // RunStarted summary is "pipeline '<name>' started (<event> on <branch>)"
                if let Some(name) = extract_quoted(&event.summary) {
                    self.pipeline_name = name;
                }
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed | EventType::LimitReached => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
            EventType::JobStarted => {
                if let Some(ref job_id) = event.job_id {
                    let result = self.jobs.entry(job_id.clone()).or_default();
                    result.status = JobStatus::Running;
                    result.started_at = Some(event.timestamp);
                }
            }
            EventType::JobSucceeded => {
                if let Some(ref job_id) = event.job_id {
                    let result = self.jobs.entry(job_id.clone()).or_default();
                    result.status = JobStatus::Succeeded;
                    result.outputs = event.outputs.clone();
                    result.artifacts = event
                        .artifacts
                        .iter()
                        .map(|name| ArtifactHandle::new(event.run_id, job_id.clone(), name.clone()))
                        .collect();
                    result.finished_at = Some(event.timestamp);
                }
            }
            EventType::JobFailed => {
                if let Some(ref job_id) = event.job_id {
                    let result = self.jobs.entry(job_id.clone()).or_default();
                    result.status = JobStatus::Failed;
                    result.exit_code = event.exit_code;
                    result.error = event.error.clone();
                    result.finished_at = Some(event.timestamp);
                }
            }
            EventType::JobSkipped => {
                if let Some(ref job_id) = event.job_id {
                    let result = self.jobs.entry(job_id.clone()).or_default();
                    result.status = JobStatus::Skipped;
                    result.error = event.error.clone();
                    result.finished_at = Some(event.timestamp);
                }
            }
            // Step-level events do not change job-level state; the job-level
            // terminal event is authoritative.
            EventType::StepStarted
            | EventType::StepCompleted
            | EventType::StepFailed
            | EventType::StepRetrying => {}
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if the run has completed (successfully or not)
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Status of a specific job, if it has a result entry
    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|r| r.status)
    }

    /// Whether every job with a result entry succeeded
    pub fn all_succeeded(&self) -> bool {
        self.jobs.values().all(|r| r.succeeded())
    }
}

/// Pull the first single-quoted token out of an event summary.
fn extract_quoted(summary: &str) -> Option<String> {
    let start = summary.find('\'')? + 1;
    let end = summary[start..].find('\'')? + start;
    Some(summary[start..end].to_string())
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// All jobs terminal, none failed
    Completed,

    /// At least one job failed, or a limit was hit
    Failed { error: String },

    /// Cancelled before completion
    Cancelled,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}
