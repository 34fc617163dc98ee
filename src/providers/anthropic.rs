//! Anthropic Messages adapter.
//!
//! Consumes `system_parts` so the static prompt block keeps its
//! `cache_control: ephemeral` marker for provider-side prefix caching.
//! Images and documents travel as base64 source blocks; tool results
//! are folded back into user turns as `tool_result` blocks, the way the
//! Messages API expects.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    ChatOptions, LLMProvider, LLMResponse, Message, ProviderError, ToolCall, ToolDefinition,
    UsageInfo,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

/// Build the top-level `system` parameter from the first system message.
///
/// When the emitter provided `system_parts`, each block keeps its cache
/// marker; otherwise the flat content becomes a single block.
fn build_system(messages: &[Message]) -> Option<Value> {
    let sys = messages.iter().find(|m| m.role == "system")?;

    if !sys.system_parts.is_empty() {
        let blocks: Vec<Value> = sys
            .system_parts
            .iter()
            .map(|b| {
                let mut block = json!({ "type": "text", "text": b.text });
                if let Some(cc) = &b.cache_control {
                    block["cache_control"] = json!({ "type": cc.r#type });
                }
                block
            })
            .collect();
        return Some(json!(blocks));
    }

    Some(json!(sys.content))
}

/// Map non-system messages into Messages-API turns.
fn build_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();

    for m in messages.iter().filter(|m| m.role != "system") {
        match m.role.as_str() {
            "assistant" => {
                let mut blocks: Vec<Value> = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": m.content }));
                }
                for tc in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "" }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
            "tool" => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id,
                    "content": m.content,
                });
                // Consecutive tool results merge into one user turn.
                if let Some(last) = out.last_mut() {
                    let is_tool_turn = last["role"] == "user"
                        && last["content"]
                            .as_array()
                            .map(|blocks| {
                                blocks.iter().all(|b| b["type"] == "tool_result")
                            })
                            .unwrap_or(false);
                    if is_tool_turn {
                        last["content"].as_array_mut().unwrap().push(block);
                        continue;
                    }
                }
                out.push(json!({ "role": "user", "content": [block] }));
            }
            _ => {
                let mut blocks: Vec<Value> = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": m.content }));
                }
                for img in &m.images {
                    blocks.push(json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": img.media_type,
                            "data": img.data,
                        }
                    }));
                }
                for file in &m.files {
                    blocks.push(json!({
                        "type": "document",
                        "source": {
                            "type": "base64",
                            "media_type": file.media_type,
                            "data": file.data,
                        }
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "" }));
                }
                out.push(json!({ "role": "user", "content": blocks }));
            }
        }
    }

    out
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        opts: &ChatOptions,
    ) -> Result<LLMResponse, ProviderError> {
        let mut body = json!({
            "model": model,
            "max_tokens": opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": build_messages(messages),
        });

        if let Some(system) = build_system(messages) {
            body["system"] = system;
        }
        if !tools.is_empty() {
            let defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(defs);
        }
        if let Some(temp) = opts.temperature {
            body["temperature"] = json!(temp);
        }

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(ProviderError::from_transport)?;

        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Fatal(format!("malformed response JSON: {e}")))?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();

        if let Some(blocks) = parsed["content"].as_array() {
            for block in blocks {
                match block["type"].as_str().unwrap_or_default() {
                    "text" => content.push_str(block["text"].as_str().unwrap_or_default()),
                    "thinking" => {
                        reasoning.push_str(block["thinking"].as_str().unwrap_or_default())
                    }
                    "tool_use" => tool_calls.push(ToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block["input"].clone(),
                    }),
                    _ => {}
                }
            }
        }

        let usage = parsed.get("usage").map(|u| {
            let prompt = u["input_tokens"].as_u64().unwrap_or(0);
            let completion = u["output_tokens"].as_u64().unwrap_or(0);
            UsageInfo {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }
        });

        Ok(LLMResponse {
            content,
            reasoning_content: reasoning,
            tool_calls,
            finish_reason: parsed["stop_reason"].as_str().unwrap_or_default().to_string(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ContentBlock;

    #[test]
    fn system_parts_keep_cache_marker() {
        let messages = vec![Message {
            role: "system".into(),
            content: "static\n\n---\n\ndynamic".into(),
            system_parts: vec![
                ContentBlock::cached_text("static"),
                ContentBlock::text("dynamic"),
            ],
            ..Default::default()
        }];

        let system = build_system(&messages).unwrap();
        let blocks = system.as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["cache_control"]["type"], "ephemeral");
        assert!(blocks[1].get("cache_control").is_none());
    }

    #[test]
    fn flat_system_without_parts() {
        let messages = vec![Message::new("system", "just text")];
        let system = build_system(&messages).unwrap();
        assert_eq!(system, json!("just text"));
    }

    #[test]
    fn tool_results_fold_into_user_turns() {
        let messages = vec![
            Message::new("user", "run it"),
            Message {
                role: "assistant".into(),
                tool_calls: vec![
                    ToolCall {
                        id: "a".into(),
                        name: "x".into(),
                        arguments: json!({}),
                    },
                    ToolCall {
                        id: "b".into(),
                        name: "y".into(),
                        arguments: json!({}),
                    },
                ],
                ..Default::default()
            },
            Message {
                role: "tool".into(),
                content: "one".into(),
                tool_call_id: "a".into(),
                ..Default::default()
            },
            Message {
                role: "tool".into(),
                content: "two".into(),
                tool_call_id: "b".into(),
                ..Default::default()
            },
        ];

        let turns = build_messages(&messages);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1]["content"][0]["type"], "tool_use");
        assert_eq!(turns[1]["content"][1]["type"], "tool_use");
        let results = turns[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "a");
        assert_eq!(results[1]["tool_use_id"], "b");
    }

    #[test]
    fn user_documents_become_document_blocks() {
        let messages = vec![Message {
            role: "user".into(),
            content: "see attached".into(),
            files: vec![crate::providers::FileBlock {
                name: "r.pdf".into(),
                media_type: "application/pdf".into(),
                data: "cGRm".into(),
            }],
            ..Default::default()
        }];
        let turns = build_messages(&messages);
        assert_eq!(turns[0]["content"][1]["type"], "document");
        assert_eq!(
            turns[0]["content"][1]["source"]["media_type"],
            "application/pdf"
        );
    }
}
