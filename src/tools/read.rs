//! Read tool: text files as UTF-8, recognized images as base64 parts.

use crate::guard::PathGuard;
use crate::llm::{Part, ToolResult};
use crate::sandbox::Executor;
use crate::tools::Tool;
use async_trait::async_trait;
use base64::Engine as _;
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadArgs {
    /// Path to read (absolute, or relative to the workspace).
    pub path: String,
    /// First line to return (0-based). Text files only.
    #[serde(default)]
    pub offset: Option<usize>,
    /// Maximum number of lines to return. Text files only.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Short human caption shown in the chat UI.
    #[serde(default)]
    pub label: Option<String>,
}

pub struct ReadTool {
    guard: Arc<PathGuard>,
    executor: Arc<Executor>,
}

impl ReadTool {
    pub fn new(guard: Arc<PathGuard>, executor: Arc<Executor>) -> Self {
        Self { guard, executor }
    }
}

/// Extension-based image detection; content is never sniffed.
fn image_mime(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("png") => Some("image/png"),
        Some("gif") => Some("image/gif"),
        Some("webp") => Some("image/webp"),
        _ => None,
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &'static str {
        "read"
    }

    fn description(&self) -> &'static str {
        "Read a file from the workspace. Text files return their contents; \
         jpg/jpeg/png/gif/webp files return the image itself."
    }

    fn parameters(&self) -> serde_json::Value {
        crate::tools::schema_of::<ReadArgs>()
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> ToolResult {
        let args: ReadArgs = match crate::tools::parse_args(args) {
            Ok(args) => args,
            Err(error) => return error,
        };

        let resolved = match self.guard.resolve(&args.path, self.executor.workspace_path()) {
            Ok(path) => path,
            Err(reason) => return ToolResult::error(reason),
        };

        let bytes = match self.executor.read_file(&resolved).await {
            Ok(bytes) => bytes,
            Err(error) => return ToolResult::error(error.to_string()),
        };

        if let Some(mime) = image_mime(&resolved) {
            let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
            return ToolResult {
                content: vec![Part::Image {
                    mime_type: mime.to_string(),
                    data,
                }],
                error: false,
            };
        }

        let text = String::from_utf8_lossy(&bytes);
        let offset = args.offset.unwrap_or(0);
        let selected: Vec<&str> = match args.limit {
            Some(limit) => text.lines().skip(offset).take(limit).collect(),
            None => text.lines().skip(offset).collect(),
        };
        if offset > 0 && selected.is_empty() {
            return ToolResult::error(format!(
                "offset {offset} is past the end of the file ({} lines)",
                text.lines().count()
            ));
        }
        ToolResult::text(selected.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (tempfile::TempDir, ReadTool) {
        let dir = tempfile::tempdir().unwrap();
        let guard = Arc::new(PathGuard::new(dir.path(), &[]));
        let executor = Arc::new(Executor::host(dir.path().to_path_buf()));
        (dir, ReadTool::new(guard, executor))
    }

    #[tokio::test]
    async fn test_read_text_with_offset_and_limit() {
        let (dir, tool) = fixtures();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc\nd\n").unwrap();

        let result = tool
            .execute(
                "t1",
                serde_json::json!({"path": dir.path().join("f.txt"), "offset": 1, "limit": 2}),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.error);
        assert_eq!(result.as_text(), "b\nc");
    }

    #[tokio::test]
    async fn test_read_outside_workspace_denied() {
        let (_dir, tool) = fixtures();
        let result = tool
            .execute(
                "t1",
                serde_json::json!({"path": "/etc/passwd"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.error);
        assert!(result.as_text().contains("outside allowed"));
    }

    #[tokio::test]
    async fn test_read_image_returns_base64_part() {
        let (dir, tool) = fixtures();
        std::fs::write(dir.path().join("pic.PNG"), [0x89, 0x50, 0x4e, 0x47]).unwrap();

        let result = tool
            .execute(
                "t1",
                serde_json::json!({"path": dir.path().join("pic.PNG")}),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.error);
        match &result.content[0] {
            Part::Image { mime_type, data } => {
                assert_eq!(mime_type, "image/png");
                assert_eq!(data, "iVBORw==");
            }
            other => panic!("expected image part, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_missing_file_is_tool_error() {
        let (dir, tool) = fixtures();
        let result = tool
            .execute(
                "t1",
                serde_json::json!({"path": dir.path().join("nope.txt")}),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.error);
    }
}
