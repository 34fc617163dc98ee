//! Model router: classify the user message as simple or complex with a
//! cheap model call and pick the downstream model accordingly.
//!
//! Classification is conservative: any failure (including timeout)
//! falls back to the simple model.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::ModelRoutingConfig;
use crate::providers::fallback::FallbackChain;
use crate::providers::{ChatOptions, Message};

const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(15);

const CLASSIFY_SYSTEM_PROMPT: &str = "You are a task difficulty classifier. \
Given the user's message, decide whether it is a \"simple\" or \"complex\" task.\n\
Simple tasks: greetings, small talk, short Q&A, translating short phrases, reminders, \
common knowledge, everyday conversation.\n\
Complex tasks: programming, mathematical reasoning, multi-step analysis, architecture \
design, debugging, data analysis, long-form writing, intricate logical reasoning.\n\
Reply with exactly one word: simple or complex";

/// Pick the model for this message, or `None` when routing is disabled.
pub async fn route_model(
    chain: &FallbackChain,
    user_message: &str,
    routing: &ModelRoutingConfig,
) -> Option<String> {
    if !routing.enabled {
        return None;
    }

    // Blank messages go straight to the simple model.
    if user_message.trim().is_empty() {
        return Some(routing.simple_model.clone());
    }

    let messages = vec![
        Message::new("system", CLASSIFY_SYSTEM_PROMPT),
        Message::new("user", user_message),
    ];
    let opts = ChatOptions {
        max_tokens: Some(20),
        temperature: Some(0.0),
        prompt_cache_key: None,
    };

    let result = tokio::time::timeout(
        CLASSIFY_TIMEOUT,
        chain.chat(&messages, &[], Some(&routing.simple_model), &opts),
    )
    .await;

    let response = match result {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(error = %e, "classification call failed, falling back to simple model");
            return Some(routing.simple_model.clone());
        }
        Err(_) => {
            warn!("classification call timed out, falling back to simple model");
            return Some(routing.simple_model.clone());
        }
    };

    let verdict = response.content.trim().to_lowercase();
    if verdict.contains("complex") {
        info!(model = %routing.complex_model, "task classified: complex");
        Some(routing.complex_model.clone())
    } else {
        info!(model = %routing.simple_model, "task classified: simple");
        Some(routing.simple_model.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fallback::ChainLink;
    use crate::providers::{LLMProvider, LLMResponse, ProviderError, ToolDefinition};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedProvider(Result<&'static str, ()>);

    #[async_trait]
    impl LLMProvider for FixedProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _model: &str,
            _opts: &ChatOptions,
        ) -> Result<LLMResponse, ProviderError> {
            match self.0 {
                Ok(text) => Ok(LLMResponse {
                    content: text.to_string(),
                    finish_reason: "stop".into(),
                    ..Default::default()
                }),
                Err(()) => Err(ProviderError::Recoverable("down".into())),
            }
        }
    }

    fn chain(reply: Result<&'static str, ()>) -> FallbackChain {
        FallbackChain::new(vec![ChainLink {
            model: "cheap".into(),
            provider: Arc::new(FixedProvider(reply)),
            timeout: Duration::from_secs(5),
            retries: 1,
        }])
    }

    fn routing() -> ModelRoutingConfig {
        ModelRoutingConfig {
            enabled: true,
            simple_model: "cheap".into(),
            complex_model: "big".into(),
        }
    }

    #[tokio::test]
    async fn disabled_routing_returns_none() {
        let chain = chain(Ok("simple"));
        let cfg = ModelRoutingConfig::default();
        assert!(route_model(&chain, "hello", &cfg).await.is_none());
    }

    #[tokio::test]
    async fn complex_verdict_selects_complex_model() {
        let chain = chain(Ok("complex"));
        let model = route_model(&chain, "refactor my compiler", &routing()).await;
        assert_eq!(model.as_deref(), Some("big"));
    }

    #[tokio::test]
    async fn simple_verdict_selects_simple_model() {
        let chain = chain(Ok("simple"));
        let model = route_model(&chain, "hi!", &routing()).await;
        assert_eq!(model.as_deref(), Some("cheap"));
    }

    #[tokio::test]
    async fn classify_error_falls_back_to_simple() {
        let chain = chain(Err(()));
        let model = route_model(&chain, "anything", &routing()).await;
        assert_eq!(model.as_deref(), Some("cheap"));
    }

    #[tokio::test]
    async fn blank_message_skips_classification() {
        let chain = chain(Err(()));
        let model = route_model(&chain, "   ", &routing()).await;
        assert_eq!(model.as_deref(), Some("cheap"));
    }
}
