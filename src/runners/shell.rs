//! Shell runner: executes steps as `sh -c` subprocesses.
//!
//! Each invocation writes its published outputs to a per-step file whose
//! path is exported as `$GANTRY_OUTPUT` (one `key=value` per line), the
//! structured replacement for scraping values out of stdout.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;

use super::{wait_cancelled, ExecError, Invocation, Runner, StepRequest};

/// Name of the env var pointing at the step output file
pub const OUTPUT_ENV: &str = "GANTRY_OUTPUT";

/// Runner that executes steps with the system shell
pub struct ShellRunner {
    /// Shell binary (default: "sh")
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    /// Create a runner using the default shell
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Create a runner with a custom shell binary
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Parse `key=value` lines from the step output file
    fn parse_outputs(content: &str) -> HashMap<String, String> {
        let mut outputs = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                outputs.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        outputs
    }
}

#[async_trait]
impl Runner for ShellRunner {
    fn name(&self) -> &str {
        "shell"
    }

    async fn invoke(
        &self,
        step: &StepRequest,
        workdir: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Invocation, ExecError> {
        // Fresh output file per attempt so a retried step starts clean
        let output_path = workdir.join(format!(".gantry-output-{}", sanitize(&step.name)));
        tokio::fs::write(&output_path, b"")
            .await
            .map_err(|e| ExecError::Spawn {
                step: step.name.clone(),
                reason: format!("failed to create output file: {}", e),
            })?;

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&step.command)
            .current_dir(workdir)
            .envs(&step.env)
            .env(OUTPUT_ENV, &output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                step: step.name.clone(),
                reason: e.to_string(),
            })?;

        let waited = tokio::select! {
            result = timeout(step.timeout, child.wait_with_output()) => result,
            _ = wait_cancelled(cancel) => {
                // kill_on_drop reaps the child when the future is dropped
                return Err(ExecError::Cancelled {
                    step: step.name.clone(),
                });
            }
        };

        let output = waited
            .map_err(|_| ExecError::Timeout {
                step: step.name.clone(),
                timeout: step.timeout,
            })?
            .map_err(|e| ExecError::Spawn {
                step: step.name.clone(),
                reason: format!("failed to wait for process: {}", e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let outputs_content =
            tokio::fs::read_to_string(&output_path)
                .await
                .map_err(|e| ExecError::Capture {
                    step: step.name.clone(),
                    reason: format!("failed to read output file: {}", e),
                })?;
        let _ = tokio::fs::remove_file(&output_path).await;

        Ok(Invocation {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
            outputs: Self::parse_outputs(&outputs_content),
        })
    }

    async fn health_check(&self) -> Result<(), ExecError> {
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg("true")
            .status()
            .await
            .map_err(|e| ExecError::Spawn {
                step: "health_check".to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(ExecError::Spawn {
                step: "health_check".to_string(),
                reason: format!("shell '{}' exited non-zero", self.shell),
            });
        }

        Ok(())
    }
}

/// Strip characters that would make an awkward filename
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
