//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML: trigger filters, limits, and a mapping of
//! job id to job spec. Jobs declare dependencies (`needs`), an optional gate
//! condition (`if`), published output keys, and artifact produce/fetch lists.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use super::limits::RunLimits;
use crate::domain::TriggerContext;

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in run records and the CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Trigger filters for this pipeline
    #[serde(default, rename = "on")]
    pub trigger: TriggerSpec,

    /// Run-level limits
    #[serde(default)]
    pub limits: RunLimits,

    /// Jobs keyed by identifier
    pub jobs: HashMap<String, Job>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition shape.
    ///
    /// Dependency cycles and unknown `needs` references are the graph
    /// builder's responsibility; this checks everything local to one job.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.jobs.is_empty() {
            anyhow::bail!("Pipeline must have at least one job");
        }

        for (job_id, job) in &self.jobs {
            if job_id.is_empty() {
                anyhow::bail!("Job with empty identifier");
            }

            if job.steps.is_empty() {
                anyhow::bail!("Job '{}' has no steps", job_id);
            }

            let mut step_names = HashSet::new();
            for step in &job.steps {
                if step.run.trim().is_empty() {
                    anyhow::bail!("Job '{}' has a step with an empty command", job_id);
                }
                if !step_names.insert(step.name.as_str()) {
                    anyhow::bail!("Job '{}' has duplicate step name '{}'", job_id, step.name);
                }
            }

            let mut artifact_names = HashSet::new();
            for artifact in &job.artifacts {
                if !artifact_names.insert(artifact.name.as_str()) {
                    anyhow::bail!(
                        "Job '{}' declares duplicate artifact '{}'",
                        job_id,
                        artifact.name
                    );
                }
            }

            // Fetches must name a declared artifact of a dependency, so the
            // scheduler can guarantee the producer finished first.
            for fetch in &job.fetch {
                if !job.needs.contains(&fetch.job) {
                    anyhow::bail!(
                        "Job '{}' fetches artifact '{}' from '{}', which is not in its needs list",
                        job_id,
                        fetch.artifact,
                        fetch.job
                    );
                }
                let producer = self.jobs.get(&fetch.job);
                let declared = producer
                    .map(|j| j.artifacts.iter().any(|a| a.name == fetch.artifact))
                    .unwrap_or(false);
                if producer.is_some() && !declared {
                    anyhow::bail!(
                        "Job '{}' fetches undeclared artifact '{}' from job '{}'",
                        job_id,
                        fetch.artifact,
                        fetch.job
                    );
                }
            }
        }

        Ok(())
    }

    /// Job identifiers in deterministic (sorted) order
    pub fn job_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Get a job by identifier
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }
}

/// Trigger filters: which events and branches start this pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Accepted event types (empty = any)
    #[serde(default)]
    pub events: Vec<String>,

    /// Accepted branch glob patterns (empty = any)
    #[serde(default)]
    pub branches: Vec<String>,

    /// Whether manual dispatch is allowed (default true)
    #[serde(default = "default_manual")]
    pub manual: bool,
}

fn default_manual() -> bool {
    true
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            branches: Vec::new(),
            manual: default_manual(),
        }
    }
}

impl TriggerSpec {
    /// Check whether a trigger context passes the filters.
    ///
    /// A "manual" event bypasses the event filter when manual dispatch is
    /// allowed; branch patterns always apply.
    pub fn matches(&self, ctx: &TriggerContext) -> bool {
        let event_ok = if ctx.event == "manual" {
            self.manual
        } else {
            self.events.is_empty() || self.events.iter().any(|e| e == &ctx.event)
        };

        let branch_ok = self.branches.is_empty()
            || self.branches.iter().any(|pattern| {
                Pattern::new(pattern)
                    .map(|p| p.matches(&ctx.branch))
                    .unwrap_or(false)
            });

        event_ok && branch_ok
    }
}

/// A single job: sequential steps gated by dependencies and a condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Identifiers of jobs that must reach a terminal status first
    #[serde(default)]
    pub needs: Vec<String>,

    /// Gate condition (e.g., `branch == "main" && success()`); default `success()`
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Output keys this job publishes for dependents
    #[serde(default)]
    pub outputs: Vec<String>,

    /// A failure of this job still admits dependents (the run is marked failed)
    #[serde(default)]
    pub continue_on_error: bool,

    /// Artifacts this job stores on success
    #[serde(default)]
    pub artifacts: Vec<ArtifactDecl>,

    /// Artifacts to copy into the workspace before the first step
    #[serde(default)]
    pub fetch: Vec<ArtifactFetch>,

    /// Environment variables applied to all steps
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Ordered steps
    pub steps: Vec<Step>,
}

/// A produced artifact: a name plus the workspace-relative path to collect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDecl {
    pub name: String,
    pub path: String,
}

/// A consumed artifact: the producing job and the artifact name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactFetch {
    pub job: String,
    pub artifact: String,
}

/// A single step in a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within the job, used in logs and events)
    pub name: String,

    /// Shell command to execute
    pub run: String,

    /// Environment variables for this step (override job env)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// A failure of this step is converted into a no-op continuation
    #[serde(default)]
    pub best_effort: bool,

    /// Retry policy for this step
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Override timeout for this step (uses limits.step_timeout_seconds if not set)
    pub timeout_seconds: Option<u64>,
}

impl Step {
    /// Get the effective timeout for this step
    pub fn timeout(&self, limits: &RunLimits) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(limits.step_timeout_seconds);
        Duration::from_secs(seconds)
    }
}

/// Retry policy for failed steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
