use std::process::Stdio;

use tracing::{debug, warn};

/// Workflow state handed to hook commands as `CASCADE_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// Lifecycle point that fired, e.g. `role_failed`.
    pub event: String,
    pub workflow_id: String,
    pub status: String,
    pub progress: String,
    pub role: Option<String>,
}

impl HookContext {
    fn env(&self) -> [(&'static str, &str); 5] {
        [
            ("CASCADE_HOOK", self.event.as_str()),
            ("CASCADE_WORKFLOW_ID", self.workflow_id.as_str()),
            ("CASCADE_STATUS", self.status.as_str()),
            ("CASCADE_PROGRESS", self.progress.as_str()),
            ("CASCADE_ROLE", self.role.as_deref().unwrap_or_default()),
        ]
    }
}

/// Run hook commands in order for one lifecycle point.
///
/// Output is discarded. Failures are logged against the workflow and counted;
/// they never reach the engine.
pub async fn run_hooks(commands: &[String], ctx: &HookContext) -> usize {
    let mut failed = 0;
    for cmd in commands {
        debug!(workflow_id = %ctx.workflow_id, hook = %ctx.event, command = %cmd, "Running hook");
        let status = tokio::process::Command::new("sh")
            .args(["-c", cmd])
            .envs(ctx.env())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                failed += 1;
                warn!(
                    workflow_id = %ctx.workflow_id,
                    hook = %ctx.event,
                    role = ctx.role.as_deref().unwrap_or("-"),
                    command = %cmd,
                    code = s.code(),
                    "Workflow hook exited non-zero"
                );
            }
            Err(e) => {
                failed += 1;
                warn!(
                    workflow_id = %ctx.workflow_id,
                    hook = %ctx.event,
                    command = %cmd,
                    error = %e,
                    "Workflow hook could not start"
                );
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HookContext {
        HookContext {
            event: "role_complete".into(),
            workflow_id: "wf-1".into(),
            status: "running".into(),
            progress: "2/4".into(),
            role: Some("tester".into()),
        }
    }

    #[tokio::test]
    async fn test_hook_receives_workflow_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.out");
        let cmd = format!(
            "echo \"$CASCADE_HOOK $CASCADE_WORKFLOW_ID $CASCADE_ROLE $CASCADE_PROGRESS\" > {}",
            out.display()
        );

        assert_eq!(run_hooks(&[cmd], &ctx()).await, 0);

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "role_complete wf-1 tester 2/4");
    }

    #[tokio::test]
    async fn test_missing_role_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.out");
        let cmd = format!("echo \"[$CASCADE_ROLE]\" > {}", out.display());
        let ctx = HookContext {
            role: None,
            ..ctx()
        };

        run_hooks(&[cmd], &ctx).await;
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "[]");
    }

    #[tokio::test]
    async fn test_failures_counted_and_later_hooks_still_run() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("after.out");
        let commands = vec![
            "exit 3".to_string(),
            format!("touch {}", out.display()),
        ];

        assert_eq!(run_hooks(&commands, &ctx()).await, 1);
        assert!(out.exists());
    }
}
