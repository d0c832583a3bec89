// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub web: WebServerConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name with `--model <key>` or `--model <key>/<model>`.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: anthropic
    ///     base_url: http://localhost:11434/v1
    ///     name: claude-instant
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier. Currently "anthropic" and "mock" are built in.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override. Useful for local proxies or compatible gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,

    // ── Prompt caching (Anthropic) ────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,
    /// Use the extended (1-hour) cache TTL instead of the default 5-minute
    /// window. Only meaningful for the Anthropic provider.
    #[serde(default)]
    pub extended_cache_time: bool,
    /// Cache tool definitions using Anthropic prompt caching.
    #[serde(default = "default_true")]
    pub cache_tools: bool,
    /// Enable automatic conversation caching (Anthropic only).
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    // ── Mock provider ─────────────────────────────────────────────────────────
    /// Path to YAML mock-responses file (used when provider = "mock").
    /// Can also be set via the NORTH_MOCK_RESPONSES environment variable.
    pub mock_responses_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            // api_key_env is intentionally None here. resolve_api_key() falls
            // through to the driver's canonical env-var name (ANTHROPIC_API_KEY)
            // so that a per-step provider override never shadows the wrong key.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            mock_responses_file: None,
        }
    }
}

fn default_agent_mode() -> AgentMode {
    AgentMode::Agent
}
fn default_max_tool_rounds() -> u32 {
    200
}
/// Context-usage fraction at which the orchestrator compacts the transcript
/// before the next provider round.
fn default_compaction_threshold() -> f32 {
    0.92
}
fn default_compaction_keep_recent() -> usize {
    10
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_compaction_overhead_reserve() -> f32 {
    0.10
}

/// Strategy used when compacting the session context.
///
/// `Structured` (default) instructs the model to produce the five-field
/// rolling summary object directly as JSON. `Narrative` uses a looser
/// free-form summarisation prompt and is kept for comparison / fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default mode when none is specified on the CLI
    #[serde(default = "default_agent_mode")]
    pub default_mode: AgentMode,
    /// Maximum number of autonomous tool-call rounds before stopping
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Token fraction at which compaction triggers (0.0–1.0).
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of most-recent user/assistant entries kept verbatim when the
    /// transcript is trimmed during compaction. Tool and command_executed
    /// entries outside this window are dropped; resolved review entries are
    /// always kept regardless of position.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Compaction checkpoint format.
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the session. A value of 0
    /// disables per-result truncation entirely.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Fraction of the context window reserved for tool schemas and
    /// measurement error in the token approximation. Reduces the effective
    /// compaction trigger threshold.
    #[serde(default = "default_compaction_overhead_reserve")]
    pub compaction_overhead_reserve: f32,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_mode: AgentMode::Agent,
            max_tool_rounds: 200,
            compaction_threshold: default_compaction_threshold(),
            compaction_keep_recent: default_compaction_keep_recent(),
            compaction_strategy: CompactionStrategy::Structured,
            tool_result_token_cap: default_tool_result_token_cap(),
            compaction_overhead_reserve: default_compaction_overhead_reserve(),
            system_prompt: None,
        }
    }
}

/// Interaction mode, controlling which tools the Tool Registry advertises to
/// the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Read-only — write and shell tools are stripped from the advertised set.
    Ask,
    /// Full agent with read/write/shell tools.
    Agent,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Ask => write!(f, "ask"),
            AgentMode::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default timeout in seconds for a single shell command.
    #[serde(default = "ToolsConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Shell-command glob patterns (`*`/`?`) that run without a review gate.
    #[serde(default = "ToolsConfig::default_auto_approve_patterns")]
    pub auto_approve_patterns: Vec<String>,
    /// Shell-command glob patterns that are always rejected, taking priority
    /// over `auto_approve_patterns`.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

impl ToolsConfig {
    fn default_timeout_secs() -> u64 {
        60
    }
    fn default_auto_approve_patterns() -> Vec<String> {
        vec!["cat *".into(), "ls *".into()]
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            auto_approve_patterns: Self::default_auto_approve_patterns(),
            deny_patterns: Vec::new(),
        }
    }
}

/// Configuration for the optional JSON-over-WebSocket remote View.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebServerConfig {
    /// Enable the WebSocket control server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the control server to. Must be loopback unless an
    /// explicit origin allowlist is configured.
    #[serde(default = "WebServerConfig::default_bind")]
    pub bind: String,
    /// Wire protocol version advertised in `ready`/`hello` negotiation.
    #[serde(default = "WebServerConfig::default_protocol_version")]
    pub protocol_version: u32,
    /// Additional allowed Origin header values beyond the loopback default.
    #[serde(default)]
    pub origin_allowlist: Vec<String>,
    /// Review-gate timeout in seconds before it auto-resolves to the
    /// terminal rejection decision for its kind. 0 disables the timeout.
    #[serde(default = "WebServerConfig::default_review_timeout_secs")]
    pub review_timeout_secs: u64,
}

impl WebServerConfig {
    fn default_bind() -> String {
        "127.0.0.1:7824".into()
    }
    fn default_protocol_version() -> u32 {
        1
    }
    fn default_review_timeout_secs() -> u64 {
        300
    }
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: Self::default_bind(),
            protocol_version: Self::default_protocol_version(),
            origin_allowlist: Vec::new(),
            review_timeout_secs: Self::default_review_timeout_secs(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
