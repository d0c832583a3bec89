// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod sanitize;
mod types;
mod provider;
mod anthropic;
mod mock;
mod yaml_mock;

pub use catalog::{ModelCatalogEntry, InputModality};
pub use types::*;
pub use provider::{ModelProvider, AssistantToolCall, ToolResultInput};
pub use anthropic::AnthropicProvider;
pub use mock::{HangingMockProvider, MockProvider, ScriptedMockProvider};
pub use yaml_mock::YamlMockProvider;

use anyhow::bail;
use north_config::ModelConfig;

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`. Only
/// `anthropic` and `mock` are recognised; this adapter boundary exists to
/// prove the orchestrator talks to providers through a trait, not to host a
/// matrix of vendor integrations.
///
/// When `max_tokens` is not set in config, the model's `max_output_tokens` is
/// resolved from the static catalog.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    let resolved_max_tokens = cfg
        .max_tokens
        .or_else(|| catalog::lookup(&cfg.provider, &cfg.name).map(|e| e.max_output_tokens));

    match cfg.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicProvider::with_cache(
            cfg.name.clone(),
            resolve_api_key(cfg),
            cfg.base_url.clone(),
            resolved_max_tokens,
            cfg.temperature,
            cfg.cache_system_prompt,
            cfg.extended_cache_time,
            cfg.cache_tools,
            cfg.cache_conversation,
        ))),
        "mock" => {
            let responses_path = std::env::var("NORTH_MOCK_RESPONSES")
                .ok()
                .or_else(|| cfg.mock_responses_file.clone());
            if let Some(path) = responses_path {
                Ok(Box::new(YamlMockProvider::from_file(&path)?))
            } else {
                Ok(Box::new(MockProvider))
            }
        }
        other => bail!(
            "unknown model provider: {other:?}\n\
             Recognised providers: anthropic, mock"
        ),
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    std::env::var("ANTHROPIC_API_KEY").ok()
}

/// Apply a `/model <id>` override on top of the session's base config.
///
/// The orchestrator does not re-resolve provider credentials here: a model
/// switch inside one Anthropic session only ever changes the model id, which
/// is why [`CompletionRequest::model_override`] exists as the narrower path
/// for mid-conversation switches. This helper is for constructing a fresh
/// provider from a changed config (e.g. at startup).
pub fn resolve_model_cfg(base: &ModelConfig, model_id: &str) -> ModelConfig {
    let mut cfg = base.clone();
    cfg.name = model_id.to_string();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use north_config::ModelConfig;

    fn minimal_config(provider: &str, model: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            name: model.into(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn from_config_anthropic_succeeds() {
        let cfg = minimal_config("anthropic", "claude-sonnet-4-5");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_mock_succeeds() {
        let cfg = minimal_config("mock", "mock-model");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_unknown_provider_returns_error() {
        let cfg = minimal_config("totally_unknown_provider_xyz", "some-model");
        let result = from_config(&cfg);
        assert!(result.is_err());
        let msg = result.err().unwrap().to_string();
        assert!(msg.contains("unknown model provider"));
    }

    #[test]
    fn resolve_api_key_prefers_explicit_key() {
        let cfg = ModelConfig {
            api_key: Some("explicit-key".into()),
            api_key_env: Some("NONEXISTENT_ENV_VAR_XYZ".into()),
            ..ModelConfig::default()
        };
        let key = resolve_api_key(&cfg);
        assert_eq!(key.as_deref(), Some("explicit-key"));
    }

    #[test]
    fn resolve_model_cfg_changes_only_name() {
        let base = minimal_config("anthropic", "claude-sonnet-4-5");
        let cfg = resolve_model_cfg(&base, "claude-opus-4-6");
        assert_eq!(cfg.provider, "anthropic");
        assert_eq!(cfg.name, "claude-opus-4-6");
    }
}
