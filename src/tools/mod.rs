//! Tool trait and shared helpers.
//!
//! Every tool validates paths through the path guard before any I/O and
//! executes through the sandbox executor. Failures are returned as tool
//! results with the error flag set; a tool error never ends a run.

pub mod attach;
pub mod bash;
pub mod delegate;
pub mod edit;
pub mod read;
pub mod write;

pub use attach::AttachTool;
pub use bash::BashTool;
pub use delegate::DelegateTool;
pub use edit::EditTool;
pub use read::ReadTool;
pub use write::WriteTool;

use crate::llm::ToolResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// An agent tool: name, schema, and an execution entry point.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the argument object.
    fn parameters(&self) -> serde_json::Value;
    async fn execute(
        &self,
        tool_call_id: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolResult;
}

/// Human caption for a tool call: the optional `label` argument, falling
/// back to the tool name.
pub fn label_of(tool_name: &str, args: &serde_json::Value) -> String {
    args.get("label")
        .and_then(|value| value.as_str())
        .filter(|label| !label.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| tool_name.to_string())
}

/// Derive the JSON schema for a tool's argument struct.
pub(crate) fn schema_of<T: schemars::JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Deserialize tool args, mapping failures to a tool error result.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    args: serde_json::Value,
) -> std::result::Result<T, ToolResult> {
    serde_json::from_value(args)
        .map_err(|error| ToolResult::error(format!("invalid arguments: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_falls_back_to_name() {
        assert_eq!(label_of("read", &serde_json::json!({})), "read");
        assert_eq!(
            label_of("read", &serde_json::json!({"label": "peek config"})),
            "peek config"
        );
        assert_eq!(label_of("read", &serde_json::json!({"label": "  "})), "read");
    }
}
