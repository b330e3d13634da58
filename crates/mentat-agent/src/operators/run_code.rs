use anyhow::Result;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::{resolve_in_workdir, sanitize_output};
use crate::goal::Goal;
use crate::operator::{Operator, OperatorResult, OperatorSpec};
use crate::state::AgentState;

/// Deadline on executed programs.
const RUN_TIMEOUT: Duration = Duration::from_secs(10);

/// Execute a script from the working directory and capture its output.
pub struct RunCodeOperator {
    path: String,
}

impl RunCodeOperator {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn interpreter(&self) -> Option<&'static str> {
        let ext = self.path.rsplit('.').next()?;
        match ext {
            "py" => Some("python3"),
            "js" => Some("node"),
            "sh" => Some("sh"),
            _ => None,
        }
    }
}

#[async_trait]
impl Operator for RunCodeOperator {
    fn spec(&self) -> OperatorSpec {
        OperatorSpec::new("run_code").with_path(self.path.clone())
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn is_applicable(&self, state: &AgentState, _goal: &Goal) -> bool {
        self.interpreter().is_some()
            && resolve_in_workdir(state, &self.path)
                .map(|p| p.is_file())
                .unwrap_or(false)
    }

    async fn execute(&self, state: &AgentState) -> Result<OperatorResult> {
        let resolved = match resolve_in_workdir(state, &self.path) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(OperatorResult::failed(e.to_string())),
        };
        let Some(interpreter) = self.interpreter() else {
            return Ok(OperatorResult::failed(format!(
                "no interpreter for {}",
                self.path
            )));
        };

        let mut cmd = Command::new(interpreter);
        cmd.arg(&resolved)
            .current_dir(&state.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match timeout(RUN_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(OperatorResult::failed(format!(
                    "failed to spawn {interpreter}: {e}"
                )))
            }
            Err(_) => {
                return Ok(OperatorResult::failed(format!(
                    "{} timed out after {}s",
                    self.path,
                    RUN_TIMEOUT.as_secs()
                )))
            }
        };

        let stdout = sanitize_output(&String::from_utf8_lossy(&output.stdout));
        let stderr = sanitize_output(&String::from_utf8_lossy(&output.stderr));

        let mut next = state.successor();
        next.last_command_output = Some(stdout.clone());

        if output.status.success() {
            Ok(OperatorResult::succeeded(next, stdout))
        } else {
            let error = if stderr.is_empty() {
                format!("{} exited with {}", self.path, output.status)
            } else {
                stderr.lines().last().unwrap_or(&stderr).to_string()
            };
            next.push_error(error.clone());
            Ok(OperatorResult {
                success: false,
                new_state: Some(next),
                output: stdout,
                error: Some(error),
            })
        }
    }
}
