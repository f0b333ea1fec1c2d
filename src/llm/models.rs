//! Model registry: context windows and per-token pricing.
//!
//! Loaded from the `MODELS_JSON` environment variable when present,
//! otherwise a small built-in table. Unknown models cost nothing and get a
//! conservative context window, so usage summaries degrade gracefully.

use crate::error::{Error, Result};
use crate::llm::Usage;
use serde::Deserialize;
use std::collections::HashMap;

/// Per-model metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    #[serde(default)]
    pub output_cost_per_mtok: f64,
    #[serde(default)]
    pub cache_read_cost_per_mtok: f64,
    #[serde(default)]
    pub cache_write_cost_per_mtok: f64,
    /// Whether thinking parts are posted to the thread (they are always
    /// logged regardless).
    #[serde(default)]
    pub post_thinking: bool,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_context_window() -> u64 {
    200_000
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            context_window: default_context_window(),
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
            cache_read_cost_per_mtok: 0.0,
            cache_write_cost_per_mtok: 0.0,
            post_thinking: false,
        }
    }
}

/// Registry keyed by model id.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelInfo>,
}

impl ModelRegistry {
    /// Built-in table for common models.
    pub fn builtin() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "claude-sonnet-4-20250514".to_string(),
            ModelInfo {
                input_cost_per_mtok: 3.0,
                output_cost_per_mtok: 15.0,
                cache_read_cost_per_mtok: 0.3,
                cache_write_cost_per_mtok: 3.75,
                ..ModelInfo::default()
            },
        );
        models.insert(
            "claude-haiku-4-20250514".to_string(),
            ModelInfo {
                input_cost_per_mtok: 0.8,
                output_cost_per_mtok: 4.0,
                cache_read_cost_per_mtok: 0.08,
                cache_write_cost_per_mtok: 1.0,
                ..ModelInfo::default()
            },
        );
        Self { models }
    }

    /// Parse `MODELS_JSON` (object keyed by model id) over the built-ins.
    pub fn from_env_json(json: Option<&str>) -> Result<Self> {
        let mut registry = Self::builtin();
        if let Some(json) = json {
            let parsed: HashMap<String, ModelInfo> = serde_json::from_str(json)
                .map_err(|error| Error::Config(format!("MODELS_JSON parse failed: {error}")))?;
            registry.models.extend(parsed);
        }
        Ok(registry)
    }

    pub fn get(&self, model_id: &str) -> ModelInfo {
        self.models.get(model_id).cloned().unwrap_or_default()
    }

    /// Record the provider for a model not described by `MODELS_JSON`
    /// (`MODEL_PROVIDER=local` makes usage summaries post despite zero cost).
    pub fn set_provider(&mut self, model_id: &str, provider: &str) {
        self.models
            .entry(model_id.to_string())
            .or_default()
            .provider = provider.to_string();
    }

    /// Dollar cost of accumulated usage for a model. Unknown models are
    /// free (local providers report zero pricing anyway).
    pub fn cost(&self, model_id: &str, usage: &Usage) -> f64 {
        let info = self.get(model_id);
        let per = |tokens: u64, rate: f64| tokens as f64 / 1_000_000.0 * rate;
        per(usage.input, info.input_cost_per_mtok)
            + per(usage.output, info.output_cost_per_mtok)
            + per(usage.cache_read, info.cache_read_cost_per_mtok)
            + per(usage.cache_write, info.cache_write_cost_per_mtok)
    }
}
