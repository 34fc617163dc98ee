//! Provider fallback chain: ordered attempts with per-attempt timeouts
//! and a retry budget per link.
//!
//! Recoverable errors advance to the next attempt (then the next link);
//! fatal errors surface immediately. A successful response that carries
//! tool calls is still success — tool iteration belongs to the agent
//! loop, not the chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{
    build_provider, resolve_model, ChatOptions, LLMProvider, LLMResponse, Message, ModelEntry,
    ProviderError, ToolDefinition,
};
use crate::config::FallbackEntryConfig;

/// One link in the chain: a model, the adapter that reaches it, a
/// per-attempt timeout, and how many attempts it gets.
pub struct ChainLink {
    pub model: String,
    pub provider: Arc<dyn LLMProvider>,
    pub timeout: Duration,
    pub retries: u32,
}

pub struct FallbackChain {
    links: Vec<ChainLink>,
}

impl FallbackChain {
    pub fn new(links: Vec<ChainLink>) -> Self {
        Self { links }
    }

    /// Build a chain from config entries, resolving each model through
    /// the model list (with prefix inference for bare names).
    pub fn from_config(
        entries: &[FallbackEntryConfig],
        models: &HashMap<String, ModelEntry>,
    ) -> Self {
        let links = entries
            .iter()
            .map(|e| {
                let resolved = resolve_model(&e.model, models);
                ChainLink {
                    model: resolved.wire_model.clone(),
                    provider: Arc::from(build_provider(&resolved)),
                    timeout: Duration::from_secs(e.timeout_secs),
                    retries: e.retries.max(1),
                }
            })
            .collect();
        Self { links }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// First model in the chain, used as the default when the router is
    /// disabled.
    pub fn primary_model(&self) -> Option<&str> {
        self.links.first().map(|l| l.model.as_str())
    }

    /// Run the chain. `model_override` (from the router) replaces the
    /// wire model on every link while keeping each link's transport.
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model_override: Option<&str>,
        opts: &ChatOptions,
    ) -> Result<LLMResponse, ProviderError> {
        let mut last_err = ProviderError::Recoverable("no providers configured".into());

        for (idx, link) in self.links.iter().enumerate() {
            let model = model_override.unwrap_or(&link.model);

            for attempt in 0..link.retries {
                let result =
                    tokio::time::timeout(link.timeout, link.provider.chat(messages, tools, model, opts))
                        .await;

                match result {
                    Ok(Ok(response)) => return Ok(response),
                    Ok(Err(e @ ProviderError::Fatal(_))) => {
                        warn!(link = idx, model = %model, error = %e, "fatal provider error, not retrying");
                        return Err(e);
                    }
                    Ok(Err(e)) => {
                        warn!(
                            link = idx,
                            model = %model,
                            attempt = attempt + 1,
                            max_attempts = link.retries,
                            error = %e,
                            "provider call failed"
                        );
                        last_err = e;
                    }
                    Err(_) => {
                        warn!(
                            link = idx,
                            model = %model,
                            attempt = attempt + 1,
                            timeout_secs = link.timeout.as_secs(),
                            "provider attempt timed out"
                        );
                        last_err = ProviderError::Recoverable(format!(
                            "attempt timed out after {}s",
                            link.timeout.as_secs()
                        ));
                    }
                }
            }
        }

        Err(last_err)
    }
}
