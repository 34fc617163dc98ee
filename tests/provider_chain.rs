//! Provider adapters over a mock HTTP server, and the fallback chain's
//! classification behavior against real status codes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scuttle::providers::anthropic::AnthropicProvider;
use scuttle::providers::fallback::{ChainLink, FallbackChain};
use scuttle::providers::openai::OpenAiCompatProvider;
use scuttle::providers::{
    resolve_model, ChatOptions, ContentBlock, LLMProvider, Message, ProtocolFamily,
};

fn user(text: &str) -> Vec<Message> {
    vec![Message::new("user", text)]
}

// ── OpenAI-compatible adapter ───────────────────────────────

#[tokio::test]
async fn openai_adapter_parses_content_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "role": "assistant", "content": "hi from mock" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
        })))
        .mount(&server)
        .await;

    let provider = OpenAiCompatProvider::new(server.uri(), "test-key".into());
    let resp = provider
        .chat(&user("hello"), &[], "gpt-test", &ChatOptions::default())
        .await
        .unwrap();

    assert_eq!(resp.content, "hi from mock");
    assert_eq!(resp.finish_reason, "stop");
    assert_eq!(resp.usage.unwrap().total_tokens, 15);
}

#[tokio::test]
async fn openai_adapter_parses_tool_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "exec", "arguments": "{\"command\":\"ls\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let provider = OpenAiCompatProvider::new(server.uri(), "k".into());
    let resp = provider
        .chat(&user("list files"), &[], "gpt-test", &ChatOptions::default())
        .await
        .unwrap();

    assert_eq!(resp.tool_calls.len(), 1);
    assert_eq!(resp.tool_calls[0].id, "call_9");
    assert_eq!(resp.tool_calls[0].arguments["command"], "ls");
}

#[tokio::test]
async fn openai_adapter_sends_prompt_cache_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "prompt_cache_key": "session-7" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "cached" }, "finish_reason": "stop" }]
        })))
        .mount(&server)
        .await;

    let provider = OpenAiCompatProvider::new(server.uri(), "k".into());
    let opts = ChatOptions {
        prompt_cache_key: Some("session-7".into()),
        ..Default::default()
    };
    let resp = provider.chat(&user("hi"), &[], "gpt-test", &opts).await.unwrap();
    assert_eq!(resp.content, "cached");
}

// ── Anthropic adapter ───────────────────────────────────────

#[tokio::test]
async fn anthropic_adapter_stamps_cache_control() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "anthro-key"))
        .and(body_partial_json(json!({
            "system": [{ "type": "text", "text": "STATIC", "cache_control": { "type": "ephemeral" } }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "claude says hi" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 5 }
        })))
        .mount(&server)
        .await;

    let mut system = Message::new("system", "STATIC\n\n---\n\nDYNAMIC");
    system.system_parts = vec![
        ContentBlock::cached_text("STATIC"),
        ContentBlock::text("DYNAMIC"),
    ];
    let messages = vec![system, Message::new("user", "hello")];

    let provider = AnthropicProvider::new(server.uri(), "anthro-key".into());
    let resp = provider
        .chat(&messages, &[], "claude-test", &ChatOptions::default())
        .await
        .unwrap();

    assert_eq!(resp.content, "claude says hi");
    assert_eq!(resp.finish_reason, "end_turn");
    assert_eq!(resp.usage.unwrap().total_tokens, 15);
}

#[tokio::test]
async fn anthropic_adapter_parses_tool_use() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "text", "text": "let me check" },
                { "type": "tool_use", "id": "toolu_1", "name": "read_file",
                  "input": { "path": "notes.md" } }
            ],
            "stop_reason": "tool_use"
        })))
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(server.uri(), "k".into());
    let resp = provider
        .chat(&user("read my notes"), &[], "claude-test", &ChatOptions::default())
        .await
        .unwrap();

    assert_eq!(resp.content, "let me check");
    assert_eq!(resp.tool_calls.len(), 1);
    assert_eq!(resp.tool_calls[0].name, "read_file");
    assert_eq!(resp.tool_calls[0].arguments["path"], "notes.md");
}

// ── Chain behavior against real status codes ────────────────

#[tokio::test]
async fn chain_recovers_from_5xx_into_next_link() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&broken)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "rescued" }, "finish_reason": "stop" }]
        })))
        .mount(&healthy)
        .await;

    let chain = FallbackChain::new(vec![
        ChainLink {
            model: "primary".into(),
            provider: Arc::new(OpenAiCompatProvider::new(broken.uri(), "k".into())),
            timeout: Duration::from_secs(5),
            retries: 1,
        },
        ChainLink {
            model: "backup".into(),
            provider: Arc::new(OpenAiCompatProvider::new(healthy.uri(), "k".into())),
            timeout: Duration::from_secs(5),
            retries: 1,
        },
    ]);

    let resp = chain
        .chat(&user("hi"), &[], None, &ChatOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.content, "rescued");
}

#[tokio::test]
async fn chain_surfaces_401_without_trying_backup() {
    let unauthorized = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&unauthorized)
        .await;

    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "should not run" }, "finish_reason": "stop" }]
        })))
        .expect(0)
        .mount(&backup)
        .await;

    let chain = FallbackChain::new(vec![
        ChainLink {
            model: "primary".into(),
            provider: Arc::new(OpenAiCompatProvider::new(unauthorized.uri(), "k".into())),
            timeout: Duration::from_secs(5),
            retries: 3,
        },
        ChainLink {
            model: "backup".into(),
            provider: Arc::new(OpenAiCompatProvider::new(backup.uri(), "k".into())),
            timeout: Duration::from_secs(5),
            retries: 1,
        },
    ]);

    let err = chain
        .chat(&user("hi"), &[], None, &ChatOptions::default())
        .await
        .unwrap_err();
    assert!(!err.is_recoverable());
}

// ── Model resolution sanity at the integration level ────────

#[test]
fn bare_names_route_to_expected_families() {
    let models = HashMap::new();
    assert_eq!(
        resolve_model("claude-sonnet-4", &models).protocol,
        ProtocolFamily::Anthropic
    );
    assert_eq!(
        resolve_model("gpt-4o", &models).protocol,
        ProtocolFamily::OpenaiCompat
    );
    assert_eq!(
        resolve_model("groq/llama-3.3-70b", &models).protocol,
        ProtocolFamily::OpenaiCompat
    );
}
