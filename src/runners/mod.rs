//! Runner interfaces for step execution substrates.
//!
//! A Runner invokes a single resolved step in a workspace and reports the
//! exit status, captured output, and any key/value outputs the step
//! published. Job-level sequencing (retries, best-effort handling, artifact
//! collection) lives in the executor, not here.

pub mod shell;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

// Re-export the shell runner
pub use shell::ShellRunner;

/// Errors from provisioning or invoking a step
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to provision workspace: {0}")]
    Provision(String),

    #[error("Failed to spawn step '{step}': {reason}")]
    Spawn { step: String, reason: String },

    #[error("Step '{step}' timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("Step '{step}' cancelled")]
    Cancelled { step: String },

    #[error("Step '{step}' produced unreadable output: {reason}")]
    Capture { step: String, reason: String },
}

/// A fully resolved step, ready to execute.
///
/// The command has already been interpolated; env carries the merged
/// job/step variables plus run metadata.
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Step name (for logs and errors)
    pub name: String,

    /// Shell command to execute
    pub command: String,

    /// Environment variables for the invocation
    pub env: HashMap<String, String>,

    /// Timeout for one attempt
    pub timeout: Duration,
}

/// Result of one step invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Process exit code (0 = success)
    pub exit_code: i32,

    /// Captured stdout
    pub stdout: String,

    /// Captured stderr
    pub stderr: String,

    /// Key/value outputs the step published via `$GANTRY_OUTPUT`
    pub outputs: HashMap<String, String>,
}

impl Invocation {
    /// Whether the invocation exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Resolve only once the cancel channel carries `true`.
///
/// A dropped sender means no cancellation can ever arrive; the future then
/// stays pending instead of resolving spuriously.
pub async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Trait for step execution substrates
#[async_trait]
pub trait Runner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    /// Invoke one step in the given workspace.
    ///
    /// Honors the step timeout and the cancel channel; on cancellation the
    /// child process is killed and `ExecError::Cancelled` is returned.
    async fn invoke(
        &self,
        step: &StepRequest,
        workdir: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Invocation, ExecError>;

    /// Check that the execution substrate is usable
    async fn health_check(&self) -> Result<(), ExecError>;
}
