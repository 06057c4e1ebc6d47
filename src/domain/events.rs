//! Event types for the event-sourced engine.
//!
//! All run state changes are recorded as immutable events in an append-only log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the append-only event log.
///
/// Events are the source of truth for run state. The current state of any run
/// can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Job the event refers to (None for run-level events)
    pub job_id: Option<String>,

    /// Step name within the job (for step-level events)
    pub step_name: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Outputs published by the job (JobSucceeded only)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,

    /// Names of artifacts stored by the job (JobSucceeded only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,

    /// Exit code of the failing step (JobFailed/StepFailed)
    pub exit_code: Option<i32>,

    /// Time taken in milliseconds (for completed jobs/steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new run-level event with the current timestamp
    pub fn run_level(run_id: Uuid, event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            job_id: None,
            step_name: None,
            event_type,
            summary: summary.into(),
            outputs: HashMap::new(),
            artifacts: Vec::new(),
            exit_code: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Create a new job-level event
    pub fn job_level(
        run_id: Uuid,
        job_id: impl Into<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        let mut event = Self::run_level(run_id, event_type, summary);
        event.job_id = Some(job_id.into());
        event
    }

    /// Create a new step-level event
    pub fn step_level(
        run_id: Uuid,
        job_id: impl Into<String>,
        step_name: impl Into<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        let mut event = Self::job_level(run_id, job_id, event_type, summary);
        event.step_name = Some(step_name.into());
        event
    }

    /// Attach published outputs
    pub fn with_outputs(mut self, outputs: HashMap<String, String>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Attach stored artifact names
    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Attach the exit code of a failed step
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// All jobs reached a terminal status and none failed
    RunCompleted,

    /// At least one job failed (or a limit was hit)
    RunFailed,

    /// The run was cancelled before completion
    RunCancelled,

    /// A job was dispatched to an executor
    JobStarted,

    /// A job finished all of its steps successfully
    JobSucceeded,

    /// A step failed and the job aborted
    JobFailed,

    /// A job was skipped (failed dependency or false condition)
    JobSkipped,

    /// A step has started execution
    StepStarted,

    /// A step completed successfully
    StepCompleted,

    /// A step failed (may or may not retry)
    StepFailed,

    /// A step is being retried after failure
    StepRetrying,

    /// A run-level limit was reached, halting execution
    LimitReached,
}

/// Status of a job within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not yet dispatched
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Succeeded,

    /// A step failed
    Failed,

    /// Never executed (failed dependency, false condition, or cancellation)
    Skipped,
}

impl JobStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::job_level(
            Uuid::new_v4(),
            "build",
            EventType::JobStarted,
            "Job 'build' dispatched",
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::JobStarted);
        assert_eq!(parsed.job_id.as_deref(), Some("build"));
        assert!(parsed.step_name.is_none());
    }

    #[test]
    fn test_succeeded_event_carries_outputs() {
        let mut outputs = HashMap::new();
        outputs.insert("image_tag".to_string(), "app:abc123".to_string());

        let event = Event::job_level(
            Uuid::new_v4(),
            "build",
            EventType::JobSucceeded,
            "Job 'build' succeeded",
        )
        .with_outputs(outputs)
        .with_artifacts(vec!["dist".to_string()])
        .with_duration(1500);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.outputs.get("image_tag").unwrap(), "app:abc123");
        assert_eq!(parsed.artifacts, vec!["dist".to_string()]);
        assert_eq!(parsed.duration_ms, Some(1500));
    }

    #[test]
    fn test_failed_event_carries_exit_code() {
        let event = Event::step_level(
            Uuid::new_v4(),
            "docker",
            "scan image",
            EventType::StepFailed,
            "Step 'scan image' failed",
        )
        .with_exit_code(1)
        .with_error("vulnerabilities found".to_string());

        assert_eq!(event.exit_code, Some(1));
        assert_eq!(event.error.as_deref(), Some("vulnerabilities found"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
    }
}
