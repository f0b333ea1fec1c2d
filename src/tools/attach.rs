//! Attach tool: upload a workspace file to the chat.

use crate::ChannelId;
use crate::guard::PathGuard;
use crate::llm::ToolResult;
use crate::sandbox::Executor;
use crate::tools::Tool;
use crate::transport::ChatTransport;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AttachArgs {
    /// Path of the file to upload.
    pub path: String,
    /// Optional caption shown with the upload.
    #[serde(default)]
    pub title: Option<String>,
    /// Short human caption shown in the chat UI.
    #[serde(default)]
    pub label: Option<String>,
}

pub struct AttachTool {
    guard: Arc<PathGuard>,
    executor: Arc<Executor>,
    transport: Arc<dyn ChatTransport>,
    channel_id: ChannelId,
}

impl AttachTool {
    pub fn new(
        guard: Arc<PathGuard>,
        executor: Arc<Executor>,
        transport: Arc<dyn ChatTransport>,
        channel_id: ChannelId,
    ) -> Self {
        Self {
            guard,
            executor,
            transport,
            channel_id,
        }
    }
}

#[async_trait]
impl Tool for AttachTool {
    fn name(&self) -> &'static str {
        "attach"
    }

    fn description(&self) -> &'static str {
        "Upload a workspace file to the chat channel."
    }

    fn parameters(&self) -> serde_json::Value {
        crate::tools::schema_of::<AttachArgs>()
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> ToolResult {
        let args: AttachArgs = match crate::tools::parse_args(args) {
            Ok(args) => args,
            Err(error) => return error,
        };

        let resolved = match self.guard.resolve(&args.path, self.executor.workspace_path()) {
            Ok(path) => path,
            Err(reason) => return ToolResult::error(reason),
        };

        if !self.executor.exists(&resolved).await {
            return ToolResult::error(format!("no such file: {}", resolved.display()));
        }

        // The transport reads from the host filesystem. Container paths off
        // the workspace mount are staged through a host-side temp copy.
        let host_path = match self.executor.to_host_path(&resolved) {
            Some(path) => path,
            None => {
                let bytes = match self.executor.read_file(&resolved).await {
                    Ok(bytes) => bytes,
                    Err(error) => return ToolResult::error(error.to_string()),
                };
                let name = resolved
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".to_string());
                let staged = std::env::temp_dir().join(name);
                if let Err(error) = tokio::fs::write(&staged, bytes).await {
                    return ToolResult::error(format!("failed to stage upload: {error}"));
                }
                staged
            }
        };

        match self
            .transport
            .upload_file(&self.channel_id, &host_path, args.title.as_deref())
            .await
        {
            Ok(()) => ToolResult::text(format!("Uploaded {}", resolved.display())),
            Err(error) => ToolResult::error(format!("upload failed: {error}")),
        }
    }
}
