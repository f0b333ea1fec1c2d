//! Bash tool: guarded shell execution through the sandbox executor.

use crate::guard::CommandGuard;
use crate::llm::ToolResult;
use crate::sandbox::Executor;
use crate::tools::Tool;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default wall-clock budget for one command.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BashArgs {
    /// Shell command to run in the workspace.
    pub command: String,
    /// Wall-clock budget in seconds (default 600).
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    /// Short human caption shown in the chat UI.
    #[serde(default)]
    pub label: Option<String>,
}

pub struct BashTool {
    guard: Arc<CommandGuard>,
    executor: Arc<Executor>,
}

impl BashTool {
    pub fn new(guard: Arc<CommandGuard>, executor: Arc<Executor>) -> Self {
        Self { guard, executor }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the workspace. Only allow-listed programs may \
         appear in any pipeline segment; output is tail-truncated."
    }

    fn parameters(&self) -> serde_json::Value {
        crate::tools::schema_of::<BashArgs>()
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let args: BashArgs = match crate::tools::parse_args(args) {
            Ok(args) => args,
            Err(error) => return error,
        };

        let verdict = self.guard.check(&args.command);
        if !verdict.allowed {
            return ToolResult::error(
                verdict
                    .reason
                    .unwrap_or_else(|| "Command denied".to_string()),
            );
        }

        let timeout = args
            .timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        match self.executor.run_shell(&args.command, timeout, cancel).await {
            Ok(result) => {
                let text = result.format();
                if result.exit_code == 0 {
                    ToolResult::text(text)
                } else {
                    ToolResult::error(text)
                }
            }
            Err(error) => ToolResult::error(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (tempfile::TempDir, BashTool) {
        let dir = tempfile::tempdir().unwrap();
        let guard = Arc::new(CommandGuard::default());
        let executor = Arc::new(Executor::host(dir.path().to_path_buf()));
        (dir, BashTool::new(guard, executor))
    }

    #[tokio::test]
    async fn test_bash_runs_allowed_command() {
        let (_dir, tool) = fixtures();
        let result = tool
            .execute(
                "t1",
                serde_json::json!({"command": "echo hello"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.error);
        assert!(result.as_text().contains("hello"));
        assert!(result.as_text().contains("Exit code: 0"));
    }

    #[tokio::test]
    async fn test_bash_denies_unlisted_program() {
        let (_dir, tool) = fixtures();
        let result = tool
            .execute(
                "t1",
                serde_json::json!({"command": "sudo whoami"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.error);
        assert!(result.as_text().contains("not on the allowed commands list"));
    }

    #[tokio::test]
    async fn test_bash_nonzero_exit_is_error_result() {
        let (_dir, tool) = fixtures();
        let result = tool
            .execute(
                "t1",
                serde_json::json!({"command": "false"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.error);
        assert!(result.as_text().contains("Exit code: 1"));
    }

    #[tokio::test]
    async fn test_bash_timeout_is_error_result() {
        let (_dir, tool) = fixtures();
        let result = tool
            .execute(
                "t1",
                serde_json::json!({"command": "sleep 5", "timeout_sec": 1}),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.error);
        assert!(result.as_text().contains("timed out"));
    }
}
