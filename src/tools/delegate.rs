//! Delegate tool: escalate a task to an out-of-process coding agent.
//!
//! The agent binary is expected to print a single JSON object on stdout of
//! the shape `{"result": "...", "session_id": "..."}`. The session id is
//! surfaced back to the model so follow-up calls can resume it.

use crate::llm::ToolResult;
use crate::tools::Tool;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_MAX_TURNS: u32 = 30;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DelegateArgs {
    /// Task description for the coding agent.
    pub prompt: String,
    /// Resume an earlier delegate session.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Turn budget for the agent (default 30).
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Wall-clock budget in seconds (default 600).
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    /// Short human caption shown in the chat UI.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DelegateReply {
    #[serde(default)]
    result: String,
    #[serde(default)]
    session_id: Option<String>,
}

pub struct DelegateTool {
    /// Agent binary, e.g. `claude`.
    bin: String,
    working_dir: PathBuf,
}

impl DelegateTool {
    pub fn new(bin: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            bin: bin.into(),
            working_dir,
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &'static str {
        "delegate"
    }

    fn description(&self) -> &'static str {
        "Hand a complex coding task to a dedicated coding agent running in \
         the workspace. Returns the agent's result and a session id for \
         follow-ups."
    }

    fn parameters(&self) -> serde_json::Value {
        crate::tools::schema_of::<DelegateArgs>()
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let args: DelegateArgs = match crate::tools::parse_args(args) {
            Ok(args) => args,
            Err(error) => return error,
        };

        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.arg("-p")
            .arg(&args.prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--max-turns")
            .arg(args.max_turns.unwrap_or(DEFAULT_MAX_TURNS).to_string())
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(session_id) = &args.session_id {
            cmd.arg("--resume").arg(session_id);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                return ToolResult::error(format!("failed to spawn '{}': {error}", self.bin));
            }
        };

        let timeout = args
            .timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let output = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(error)) => return ToolResult::error(format!("delegate failed: {error}")),
                Err(_) => {
                    return ToolResult::error(format!(
                        "delegate timed out after {}s",
                        timeout.as_secs()
                    ));
                }
            },
            _ = cancel.cancelled() => return ToolResult::error("delegate aborted"),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ToolResult::error(format!(
                "delegate exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        match parse_reply(&stdout) {
            Some(reply) => {
                let mut text = reply.result;
                if let Some(session_id) = reply.session_id {
                    text.push_str(&format!("\n\n[session_id: {session_id}]"));
                }
                ToolResult::text(text)
            }
            None => ToolResult::error(format!(
                "delegate produced no JSON result: {}",
                stdout.trim()
            )),
        }
    }
}

/// The agent may print progress lines before its JSON object; take the last
/// line that parses.
fn parse_reply(stdout: &str) -> Option<DelegateReply> {
    stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<DelegateReply>(line.trim()).ok())
}
