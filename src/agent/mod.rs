//! Agent runner: one per channel, driving the LLM tool-use loop.

pub mod prompt;
pub mod runner;

pub use runner::{AgentRunner, Context, PendingTool, RunState, RunnerDeps};
