//! Top-level error types for Mother.
//!
//! Failures that the model caused (denied paths, failing commands) are
//! returned to the model as tool results and never end a run. Backend and
//! transport failures carry enough context for the user-facing thread post.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A guard rejected a model-supplied path or command.
    #[error("{0}")]
    Denied(String),

    /// A tool failed to execute (non-zero exit, timeout, bad arguments).
    #[error("tool execution failed: {0}")]
    Tool(String),

    /// The chat transport failed after its own retries.
    #[error("chat transport error: {0}")]
    Transport(String),

    /// The LLM backend signalled a retryable condition.
    #[error("backend rate limited (attempt {attempt}/{max_attempts})")]
    BackendRateLimited { attempt: u32, max_attempts: u32 },

    /// The LLM backend failed in a non-retryable way.
    #[error("backend failed: {0}")]
    BackendFatal(String),

    /// The run was aborted by a stop request.
    #[error("run aborted")]
    Aborted,

    /// Configuration loading or validation failed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Sandbox validation failed (missing or stopped container).
    #[error("sandbox validation failed: {0}")]
    Sandbox(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
