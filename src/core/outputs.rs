//! Output propagation between jobs.
//!
//! A job registers named outputs while it runs (via the `$GANTRY_OUTPUT`
//! file); after the job succeeds they become visible to dependents as
//! `<job_id>.<key>`. The registry is only written from the scheduler's
//! dispatch loop, after the producing job's result is finalized, and only
//! read while building a dependent's environment, so a read can never race
//! a write.

use std::collections::HashMap;

use thiserror::Error;

use crate::domain::{JobStatus, TriggerContext};

/// Errors from output resolution
#[derive(Debug, Clone, Error)]
pub enum OutputError {
    /// The producing job has no terminal result yet. Unreachable when the
    /// scheduler dispatches correctly; observing it is an engine bug.
    #[error("Output '{job_id}.{key}' read before job '{job_id}' finished")]
    NotReady { job_id: String, key: String },

    #[error("Job '{job_id}' did not publish output '{key}'")]
    Missing { job_id: String, key: String },

    #[error("Output reference '{reference}' is malformed (expected needs.<job>.<key>)")]
    MalformedReference { reference: String },

    #[error("Unknown placeholder '{placeholder}'")]
    UnknownPlaceholder { placeholder: String },
}

/// Registry of per-job published outputs
#[derive(Debug, Default)]
pub struct OutputRegistry {
    /// job id -> (status at finalization, outputs)
    entries: HashMap<String, (JobStatus, HashMap<String, String>)>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized job's outputs. Write-once per job id.
    pub fn finalize(&mut self, job_id: &str, status: JobStatus, outputs: HashMap<String, String>) {
        debug_assert!(status.is_terminal());
        self.entries
            .entry(job_id.to_string())
            .or_insert((status, outputs));
    }

    /// Read a single output value
    pub fn get(&self, job_id: &str, key: &str) -> Result<&str, OutputError> {
        match self.entries.get(job_id) {
            None => Err(OutputError::NotReady {
                job_id: job_id.to_string(),
                key: key.to_string(),
            }),
            Some((_, outputs)) => outputs.get(key).map(String::as_str).ok_or_else(|| {
                OutputError::Missing {
                    job_id: job_id.to_string(),
                    key: key.to_string(),
                }
            }),
        }
    }

    /// Whether a job has a finalized entry
    pub fn is_finalized(&self, job_id: &str) -> bool {
        self.entries.contains_key(job_id)
    }
}

/// Expand `${...}` placeholders in a step command.
///
/// Supported placeholders:
/// - `${needs.<job>.<key>}` — an upstream job's published output
/// - `${branch}`, `${event}`, `${commit}`, `${actor}` — run metadata
///
/// `$VAR` without braces is left untouched for the shell to expand.
pub fn interpolate(
    template: &str,
    ctx: &TriggerContext,
    registry: &OutputRegistry,
) -> Result<String, OutputError> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| OutputError::MalformedReference {
                reference: rest[start..].to_string(),
            })?;
        let placeholder = &after[..end];

        if let Some(reference) = placeholder.strip_prefix("needs.") {
            let (job_id, key) =
                reference
                    .split_once('.')
                    .ok_or_else(|| OutputError::MalformedReference {
                        reference: placeholder.to_string(),
                    })?;
            result.push_str(registry.get(job_id, key)?);
        } else {
            let value = match placeholder {
                "branch" => &ctx.branch,
                "event" => &ctx.event,
                "commit" => &ctx.commit,
                "actor" => &ctx.actor,
                _ => {
                    return Err(OutputError::UnknownPlaceholder {
                        placeholder: placeholder.to_string(),
                    })
                }
            };
            result.push_str(value);
        }

        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}
