//! Write tool: create or overwrite a file, creating parent directories.

use crate::guard::PathGuard;
use crate::llm::ToolResult;
use crate::sandbox::Executor;
use crate::tools::Tool;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteArgs {
    /// Path to write (absolute, or relative to the workspace).
    pub path: String,
    /// Full file content; any existing file is replaced.
    pub content: String,
    /// Short human caption shown in the chat UI.
    #[serde(default)]
    pub label: Option<String>,
}

pub struct WriteTool {
    guard: Arc<PathGuard>,
    executor: Arc<Executor>,
}

impl WriteTool {
    pub fn new(guard: Arc<PathGuard>, executor: Arc<Executor>) -> Self {
        Self { guard, executor }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &'static str {
        "write"
    }

    fn description(&self) -> &'static str {
        "Write a file in the workspace, creating parent directories and overwriting any existing content."
    }

    fn parameters(&self) -> serde_json::Value {
        crate::tools::schema_of::<WriteArgs>()
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> ToolResult {
        let args: WriteArgs = match crate::tools::parse_args(args) {
            Ok(args) => args,
            Err(error) => return error,
        };

        let resolved = match self.guard.resolve(&args.path, self.executor.workspace_path()) {
            Ok(path) => path,
            Err(reason) => return ToolResult::error(reason),
        };

        match self
            .executor
            .write_file(&resolved, args.content.as_bytes())
            .await
        {
            Ok(()) => ToolResult::text(format!(
                "Wrote {} bytes to {}",
                args.content.len(),
                resolved.display()
            )),
            Err(error) => ToolResult::error(error.to_string()),
        }
    }
}
