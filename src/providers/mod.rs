//! Provider abstractions: the shared multimodal message model, the
//! [`LLMProvider`] trait, the recoverable/fatal error taxonomy the
//! fallback chain dispatches on, and logical-model resolution.

pub mod anthropic;
pub mod fallback;
pub mod openai;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::{AttachmentKind, FileRef};

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

/// Marks a content block for LLM-side prefix caching.
/// Currently only "ephemeral" is used (Anthropic).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheControl {
    pub r#type: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            r#type: "ephemeral".into(),
        }
    }
}

/// A structured segment of a system message. Adapters that understand
/// `system_parts` use these to set per-block cache control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    pub r#type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            r#type: "text".into(),
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn cached_text(text: impl Into<String>) -> Self {
        Self {
            r#type: "text".into(),
            text: text.into(),
            cache_control: Some(CacheControl::ephemeral()),
        }
    }
}

/// A base64-encoded image for multimodal requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlock {
    pub media_type: String,
    pub data: String,
}

/// A base64-encoded file (PDF, DOCX, …) the model can process natively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBlock {
    pub name: String,
    pub media_type: String,
    pub data: String,
}

/// Serializable metadata of a [`FileRef`], stored in session history.
/// Carries enough to reconstruct the ref for re-resolution — never the
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRefMeta {
    pub name: String,
    pub media_type: String,
    pub kind: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

/// A model-requested tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Structured arguments as parsed from the provider response.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A single chat message shared between channels, agent, and adapters.
///
/// `content` is always the flat text; structured variants (system parts,
/// images, files) ride alongside so each adapter consumes what it
/// understands.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning_content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_parts: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_refs: Vec<FileRefMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

impl Message {
    /// Convenience constructor for a plain message.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Token usage statistics returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Response from a chat call. Tool calls present means the agent loop
/// iterates; absent means this is the final reply.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LLMResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning_content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

/// A tool definition as advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing the arguments.
    pub parameters: serde_json::Value,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Stable label for providers that key prefix caches on an opaque
    /// string (OpenAI `prompt_cache_key`).
    pub prompt_cache_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Provider failure, classified for the fallback chain.
///
/// Recoverable errors advance the chain; fatal errors surface
/// immediately.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Network failures, 5xx, rate limits, single-attempt timeouts.
    #[error("recoverable provider error: {0}")]
    Recoverable(String),
    /// Authentication, invalid request, content policy.
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProviderError::Recoverable(_))
    }

    /// Classify an HTTP status + body into the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        let msg = format!("status {status}: {}", truncate(body, 500));
        match status {
            401 | 403 => ProviderError::Fatal(format!("authentication failed — {msg}")),
            400 | 404 | 413 | 422 => ProviderError::Fatal(format!("invalid request — {msg}")),
            408 | 429 => ProviderError::Recoverable(msg),
            s if s >= 500 => ProviderError::Recoverable(msg),
            _ => ProviderError::Fatal(msg),
        }
    }

    pub fn from_transport(err: reqwest::Error) -> Self {
        ProviderError::Recoverable(format!("transport error: {err}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// LLMProvider trait
// ---------------------------------------------------------------------------

/// Uniform chat interface implemented by every protocol adapter.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        opts: &ChatOptions,
    ) -> Result<LLMResponse, ProviderError>;
}

// ---------------------------------------------------------------------------
// File-ref resolution
// ---------------------------------------------------------------------------

/// Resolves a lazy file reference into base64-encoded data.
///
/// Implemented per source platform; registered on the context builder.
#[async_trait]
pub trait FileRefResolver: Send + Sync {
    /// Returns `(media_type, base64_data)`.
    async fn resolve(&self, r#ref: &FileRef) -> anyhow::Result<(String, String)>;
}

/// Refine a resolved payload's media type by sniffing, keeping the
/// declared fallback for zip-container office docs and for binary
/// formats that short payloads mis-detect as text/plain.
pub fn refine_resolved_media_type(data: &[u8], fallback: &str) -> String {
    let head = &data[..data.len().min(512)];
    if !head.is_empty() {
        let sniffed = crate::attachments::sniff_content_type(head);
        if !fallback.is_empty() {
            if sniffed == "application/zip" && fallback.contains("openxmlformats") {
                return fallback.to_string();
            }
            if sniffed == "text/plain" && fallback != "text/plain" {
                return fallback.to_string();
            }
        }
        if !sniffed.is_empty() && sniffed != "application/octet-stream" {
            return sniffed;
        }
    }
    if fallback.is_empty() {
        "application/octet-stream".to_string()
    } else {
        fallback.to_string()
    }
}

/// Kind carried by a [`FileRefMeta`], parsed back into the shared enum.
pub fn meta_kind(meta: &FileRefMeta) -> AttachmentKind {
    meta.kind.parse().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Model resolution
// ---------------------------------------------------------------------------

/// Protocol family an adapter speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// OpenAI-style chat-completions (also Groq, Ollama, Gemini-compat,
    /// Zhipu and the CLI shims that expose the same surface).
    OpenaiCompat,
    /// Anthropic Messages API.
    Anthropic,
}

/// One entry in the logical model list: maps a model name to a protocol
/// family, base URL, credentials, and default opts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub protocol: ProtocolFamily,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Model identifier sent on the wire; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wire_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A resolved route for a logical model name.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub protocol: ProtocolFamily,
    pub base_url: String,
    pub api_key: String,
    pub wire_model: String,
    pub max_tokens: Option<u32>,
}

/// Resolve a logical model name against the configured model list, with
/// bare-name prefix inference as the fallback.
pub fn resolve_model(name: &str, models: &HashMap<String, ModelEntry>) -> ResolvedModel {
    if let Some(entry) = models.get(name) {
        return ResolvedModel {
            protocol: entry.protocol,
            base_url: entry.base_url.clone(),
            api_key: resolve_api_key(&entry.api_key),
            wire_model: entry.wire_model.clone().unwrap_or_else(|| entry.name.clone()),
            max_tokens: entry.max_tokens,
        };
    }
    infer_route(name)
}

/// Prefix inference for bare model names not present in the model list.
fn infer_route(name: &str) -> ResolvedModel {
    let route = |protocol, base_url: &str, key_env: &str, wire: &str| ResolvedModel {
        protocol,
        base_url: base_url.to_string(),
        api_key: std::env::var(key_env).unwrap_or_default(),
        wire_model: wire.to_string(),
        max_tokens: None,
    };

    if let Some(rest) = name.strip_prefix("openai/") {
        return route(
            ProtocolFamily::OpenaiCompat,
            "https://api.openai.com/v1",
            "OPENAI_API_KEY",
            rest,
        );
    }
    if name.starts_with("gpt") {
        return route(
            ProtocolFamily::OpenaiCompat,
            "https://api.openai.com/v1",
            "OPENAI_API_KEY",
            name,
        );
    }
    if let Some(rest) = name.strip_prefix("anthropic/") {
        return route(
            ProtocolFamily::Anthropic,
            "https://api.anthropic.com",
            "ANTHROPIC_API_KEY",
            rest,
        );
    }
    if name.starts_with("claude") {
        return route(
            ProtocolFamily::Anthropic,
            "https://api.anthropic.com",
            "ANTHROPIC_API_KEY",
            name,
        );
    }
    if name.starts_with("gemini/") || name.starts_with("google/") {
        let rest = name.split_once('/').map(|(_, r)| r).unwrap_or(name);
        return route(
            ProtocolFamily::OpenaiCompat,
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "GEMINI_API_KEY",
            rest,
        );
    }
    if let Some(rest) = name.strip_prefix("groq/") {
        return route(
            ProtocolFamily::OpenaiCompat,
            "https://api.groq.com/openai/v1",
            "GROQ_API_KEY",
            rest,
        );
    }
    if let Some(rest) = name.strip_prefix("ollama/") {
        return route(
            ProtocolFamily::OpenaiCompat,
            "http://localhost:11434/v1",
            "OLLAMA_API_KEY",
            rest,
        );
    }
    if name.starts_with("zhipu/") || name.starts_with("glm") {
        let rest = name.strip_prefix("zhipu/").unwrap_or(name);
        return route(
            ProtocolFamily::OpenaiCompat,
            "https://open.bigmodel.cn/api/paas/v4",
            "ZHIPU_API_KEY",
            rest,
        );
    }

    // Default route: OpenAI-compatible.
    route(
        ProtocolFamily::OpenaiCompat,
        "https://api.openai.com/v1",
        "OPENAI_API_KEY",
        name,
    )
}

/// Resolve an API key: `$VAR` references read the environment.
fn resolve_api_key(key: &str) -> String {
    if let Some(var) = key.strip_prefix('$') {
        return std::env::var(var).unwrap_or_default();
    }
    key.to_string()
}

/// Build the adapter for a resolved route.
pub fn build_provider(resolved: &ResolvedModel) -> Box<dyn LLMProvider> {
    match resolved.protocol {
        ProtocolFamily::OpenaiCompat => Box::new(openai::OpenAiCompatProvider::new(
            resolved.base_url.clone(),
            resolved.api_key.clone(),
        )),
        ProtocolFamily::Anthropic => Box::new(anthropic::AnthropicProvider::new(
            resolved.base_url.clone(),
            resolved.api_key.clone(),
        )),
    }
}
