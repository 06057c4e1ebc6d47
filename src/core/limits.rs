//! Run-level limits and enforcement.
//!
//! Prevents runaway execution through configurable limits on:
//! - Number of jobs per run
//! - Captured output sizes
//! - Step and whole-run timeouts

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to a single run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    /// Maximum number of jobs per run (default: 64)
    #[serde(default = "default_max_jobs")]
    pub max_jobs: u32,

    /// Maximum captured stdout/stderr bytes per step (default: 10MB)
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: u64,

    /// Per-step timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Total run timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,
}

fn default_max_jobs() -> u32 {
    64
}
fn default_max_capture_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB
fn default_step_timeout() -> u64 {
    300
} // 5 min
fn default_run_timeout() -> u64 {
    3600
} // 1 hour

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            max_capture_bytes: default_max_capture_bytes(),
            step_timeout_seconds: default_step_timeout(),
            run_timeout_seconds: default_run_timeout(),
        }
    }
}

impl RunLimits {
    /// Reject pipelines whose job count exceeds the limit, before a run starts
    pub fn check_job_count(&self, job_count: usize) -> Result<(), LimitViolation> {
        if job_count as u32 > self.max_jobs {
            return Err(LimitViolation::MaxJobs {
                actual: job_count as u32,
                limit: self.max_jobs,
            });
        }
        Ok(())
    }

    /// Check elapsed run time against the run timeout
    pub fn check_elapsed(&self, tracker: &RunTracker) -> Result<(), LimitViolation> {
        let elapsed = tracker.started_at.elapsed().as_secs();
        if elapsed >= self.run_timeout_seconds {
            return Err(LimitViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }
        Ok(())
    }

    /// Validate captured output size
    pub fn check_capture(&self, captured_bytes: u64) -> Result<(), LimitViolation> {
        if captured_bytes > self.max_capture_bytes {
            return Err(LimitViolation::MaxCaptureBytes {
                actual: captured_bytes,
                limit: self.max_capture_bytes,
            });
        }
        Ok(())
    }
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct RunTracker {
    /// Number of jobs dispatched
    pub jobs_dispatched: u32,

    /// Total output bytes captured across all steps
    pub captured_bytes: u64,

    /// When the run started
    pub started_at: Instant,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    /// Create a new tracker
    pub fn new() -> Self {
        Self {
            jobs_dispatched: 0,
            captured_bytes: 0,
            started_at: Instant::now(),
        }
    }

    /// Record a job dispatch
    pub fn record_dispatch(&mut self) {
        self.jobs_dispatched += 1;
    }

    /// Record captured output bytes
    pub fn record_capture(&mut self, bytes: u64) {
        self.captured_bytes += bytes;
    }

    /// Get elapsed time in seconds
    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Limit violation errors
#[derive(Debug, Clone, Error)]
pub enum LimitViolation {
    #[error("Maximum jobs exceeded: {actual} > {limit}")]
    MaxJobs { actual: u32, limit: u32 },

    #[error("Maximum captured bytes exceeded: {actual} > {limit}")]
    MaxCaptureBytes { actual: u64, limit: u64 },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}
