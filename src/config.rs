//! Configuration loading and validation.
//!
//! Everything comes from the command line and environment variables; the
//! workspace directory is the only positional input.

use crate::error::{Error, Result};
use crate::guard::{CommandOverrides, parse_allowed_commands_env};
use crate::llm::models::ModelRegistry;
use std::path::PathBuf;

/// Which executor backs the tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxMode {
    Host,
    /// Exec into this named, already-running container.
    Container(String),
}

impl SandboxMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "host" => Self::Host,
            name => Self::Container(name.to_string()),
        }
    }
}

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: PathBuf,
    pub sandbox: SandboxMode,
    pub cli: bool,
    pub bot_token: Option<String>,
    pub guild_id: Option<u64>,
    pub model_provider: String,
    pub model_id: String,
    pub llm_url: String,
    pub api_key: Option<String>,
    pub allowed_paths: Vec<PathBuf>,
    pub command_overrides: CommandOverrides,
    pub models: ModelRegistry,
    /// Coding-agent binary for the delegate tool.
    pub delegate_bin: Option<String>,
}

impl Config {
    /// Load from the environment. `workspace`, `sandbox`, and `cli` come
    /// from the command line.
    pub fn load(workspace: PathBuf, sandbox: SandboxMode, cli: bool) -> Result<Self> {
        let bot_token = env_nonempty("BOT_TOKEN");
        let guild_id = match env_nonempty("GUILD_ID") {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| Error::Config(format!("GUILD_ID is not a number: {raw}")))?,
            ),
            None => None,
        };

        if !cli {
            if bot_token.is_none() {
                return Err(Error::Config("BOT_TOKEN is required (or pass --cli)".into()));
            }
            if guild_id.is_none() {
                return Err(Error::Config("GUILD_ID is required (or pass --cli)".into()));
            }
        }

        let models_json = env_nonempty("MODELS_JSON");
        let mut models = ModelRegistry::from_env_json(models_json.as_deref())?;

        let model_provider = env_nonempty("MODEL_PROVIDER").unwrap_or_else(|| "anthropic".into());
        let model_id =
            env_nonempty("MODEL_ID").unwrap_or_else(|| "claude-sonnet-4-20250514".into());
        if models_json.is_none() && model_provider != "anthropic" {
            models.set_provider(&model_id, &model_provider);
        }

        let allowed_paths = env_nonempty("ALLOWED_PATHS")
            .map(|raw| raw.split(':').map(PathBuf::from).collect())
            .unwrap_or_default();

        let command_overrides = env_nonempty("ALLOWED_COMMANDS")
            .map(|raw| parse_allowed_commands_env(&raw))
            .unwrap_or_default();

        Ok(Self {
            workspace,
            sandbox,
            cli,
            bot_token,
            guild_id,
            model_provider,
            model_id,
            llm_url: env_nonempty("LLM_URL")
                .unwrap_or_else(|| "https://api.anthropic.com".into()),
            api_key: env_nonempty("ANTHROPIC_API_KEY"),
            allowed_paths,
            command_overrides,
            models,
            delegate_bin: env_nonempty("DELEGATE_BIN"),
        })
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_mode_parse() {
        assert_eq!(SandboxMode::parse("host"), SandboxMode::Host);
        assert_eq!(
            SandboxMode::parse("mother-sandbox"),
            SandboxMode::Container("mother-sandbox".to_string())
        );
    }
}
