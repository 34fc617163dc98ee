//! Configuration loaded from `config.yaml`.
//!
//! The engine consumes these contracts; the on-disk schema ownership and
//! migration helpers live with the host CLI.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::providers::ModelEntry;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Logical model definitions. Bare names absent from this list fall
    /// back to prefix inference.
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    /// Ordered fallback chain tried for every chat call.
    #[serde(default)]
    pub fallback_chain: Vec<FallbackEntryConfig>,
    /// Optional cheap-model routing between simple and complex models.
    #[serde(default)]
    pub model_routing: ModelRoutingConfig,
    /// Agent loop settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Attachment processing caps.
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    /// Tool sandbox settings.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Per-channel settings keyed by channel name.
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

/// One link of the fallback chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackEntryConfig {
    pub model: String,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_attempt_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts before advancing to the next link.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

fn default_retries() -> u32 {
    1
}

/// Cheap-model task routing.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ModelRoutingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub simple_model: String,
    #[serde(default)]
    pub complex_model: String,
}

/// Agent loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Workspace directory consumed by the context builder and tools.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Max tool-call iterations per inbound message.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Aggregate wall-time budget for one inbound message, seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Summarize once history exceeds this many turns...
    #[serde(default = "default_summary_turns")]
    pub summary_trigger_turns: usize,
    /// ...or this many cumulative content chars.
    #[serde(default = "default_summary_chars")]
    pub summary_trigger_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            max_iterations: default_max_iterations(),
            request_timeout_secs: default_request_timeout_secs(),
            summary_trigger_turns: default_summary_turns(),
            summary_trigger_chars: default_summary_chars(),
        }
    }
}

fn default_workspace() -> String {
    crate::scuttle_home()
        .join("workspace")
        .to_string_lossy()
        .into_owned()
}

fn default_max_iterations() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_summary_turns() -> usize {
    24
}

fn default_summary_chars() -> usize {
    24_000
}

/// Attachment processing caps.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentsConfig {
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size_bytes(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

fn default_max_file_size_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_max_text_chars() -> usize {
    60_000
}

/// Tool sandbox settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Confine filesystem access and working dirs to the workspace.
    #[serde(default = "default_true")]
    pub restrict_to_workspace: bool,
    #[serde(default)]
    pub exec: ExecConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            restrict_to_workspace: true,
            exec: ExecConfig::default(),
        }
    }
}

/// Shell tool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecConfig {
    /// Command timeout in seconds.
    #[serde(default = "default_exec_timeout_secs")]
    pub timeout_secs: u64,
    /// Enable the built-in destructive-command deny patterns.
    #[serde(default = "default_true")]
    pub enable_deny_patterns: bool,
    /// Regexes that exempt matching commands from the deny patterns.
    #[serde(default)]
    pub custom_allow_patterns: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout_secs(),
            enable_deny_patterns: true,
            custom_allow_patterns: Vec::new(),
        }
    }
}

fn default_exec_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

/// Per-channel settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Identity strings admitted by the channel (canonical, compound, or
    /// bare form). Empty admits everyone.
    #[serde(default)]
    pub allow_from: Vec<String>,
    #[serde(default)]
    pub group_trigger: GroupTriggerConfig,
}

/// Group-chat trigger rules.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GroupTriggerConfig {
    /// Only respond when the bot is mentioned.
    #[serde(default)]
    pub mention_only: bool,
    /// Respond when content starts with any of these (prefix stripped).
    #[serde(default)]
    pub prefixes: Vec<String>,
}

impl Config {
    /// Read and parse a YAML configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).context("failed to parse config YAML")?;
        config.validate()?;

        tracing::debug!(
            models = config.models.len(),
            chain = config.fallback_chain.len(),
            channels = config.channels.len(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                anyhow::bail!("config: duplicate model name: {}", model.name);
            }
        }

        if self.fallback_chain.is_empty() {
            anyhow::bail!("config: fallback_chain must list at least one model");
        }
        for entry in &self.fallback_chain {
            if entry.model.trim().is_empty() {
                anyhow::bail!("config: fallback_chain entry has empty model");
            }
            if entry.timeout_secs == 0 {
                anyhow::bail!(
                    "config: fallback_chain entry '{}' has timeout_secs=0",
                    entry.model
                );
            }
        }

        if self.model_routing.enabled
            && (self.model_routing.simple_model.is_empty()
                || self.model_routing.complex_model.is_empty())
        {
            anyhow::bail!("config: model_routing enabled but simple_model/complex_model unset");
        }

        for pattern in &self.tools.exec.custom_allow_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("config: invalid allow pattern: {pattern}"))?;
        }

        Ok(())
    }

    /// Model list as a name-keyed map for resolution.
    pub fn model_map(&self) -> HashMap<String, ModelEntry> {
        self.models
            .iter()
            .map(|m| (m.name.clone(), m.clone()))
            .collect()
    }
}
