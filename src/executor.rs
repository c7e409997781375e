use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use cascade_core::config::ExecutorConfig;
use cascade_core::context::IsolatedRoleContext;
use cascade_core::error::{CascadeError, Result};
use cascade_core::traits::RoleExecutor;
use cascade_core::types::RoleResult;

const MAX_SUMMARY_CHARS: usize = 4000;

/// Runs each role as `sh -c <command>`.
///
/// The rendered context goes to stdin. `CASCADE_ROLE` and
/// `CASCADE_WORKFLOW_ID` are set. Stdout is read as a JSON `RoleResult`;
/// `role_id` and `status` may be omitted. Plain-text stdout becomes the
/// handoff summary.
pub struct ShellRoleExecutor {
    command: String,
    timeout_secs: u64,
}

impl ShellRoleExecutor {
    pub fn new(command: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            timeout_secs,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.command.clone(), config.timeout_secs)
    }

    async fn run(&self, role: String, context: IsolatedRoleContext) -> Result<RoleResult> {
        debug!(role = %role, command = %self.command, "Executing role command");

        let spawn_err = |e: std::io::Error| CascadeError::RoleExecution {
            role: role.clone(),
            message: format!("failed to run command: {}", e),
        };

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CASCADE_ROLE", &role)
            .env("CASCADE_WORKFLOW_ID", &context.workflow_id.0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let stdin = child.stdin.take();
        let input = context.render();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin closes the pipe early
                stdin.write_all(input.as_bytes()).await.ok();
            }
        };
        // Feed stdin while draining stdout so neither pipe can stall the child
        let exchange = async move { tokio::join!(feed, child.wait_with_output()).1 };

        let timeout = Duration::from_secs(self.timeout_secs);
        let output = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result.map_err(spawn_err)?,
            Err(_) => {
                return Err(CascadeError::RoleTimeout {
                    role,
                    timeout_secs: self.timeout_secs,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            return Ok(RoleResult::failed(
                role,
                "exit_code",
                format!("exit code {}: {}", code, truncate(stderr.trim(), 2000)),
            ));
        }

        Ok(parse_output(&role, &stdout))
    }
}

impl RoleExecutor for ShellRoleExecutor {
    fn execute(
        &self,
        role: String,
        context: IsolatedRoleContext,
    ) -> BoxFuture<'_, Result<RoleResult>> {
        Box::pin(self.run(role, context))
    }
}

fn parse_output(role: &str, stdout: &str) -> RoleResult {
    let trimmed = stdout.trim();
    if let Ok(serde_json::Value::Object(mut map)) = serde_json::from_str(trimmed) {
        map.entry("role_id")
            .or_insert_with(|| serde_json::Value::String(role.to_string()));
        map.entry("status")
            .or_insert_with(|| serde_json::Value::String("completed".to_string()));
        match serde_json::from_value::<RoleResult>(serde_json::Value::Object(map)) {
            Ok(result) => return result,
            Err(e) => debug!(role, error = %e, "Output is JSON but not a role result"),
        }
    }

    let mut result = RoleResult::completed(role);
    if !trimmed.is_empty() {
        result = result.with_summary(truncate(trimmed, MAX_SUMMARY_CHARS).to_string());
    }
    result
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
