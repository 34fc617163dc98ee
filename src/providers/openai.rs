//! OpenAI-compatible chat-completions adapter.
//!
//! Speaks the `/chat/completions` surface shared by OpenAI, Groq,
//! Ollama, Zhipu, Gemini's compat endpoint, and local servers. Consumes
//! the flat `content` of system messages; `prompt_cache_key` is passed
//! through when set.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    ChatOptions, LLMProvider, LLMResponse, Message, ProviderError, ToolCall, ToolDefinition,
    UsageInfo,
};

pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatProvider {
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
        format!("{}/chat/completions", self.base_url)
    }
}

/// Serialize the shared message model into chat-completions JSON.
///
/// Assistant tool calls and tool results keep their pairing ids; user
/// messages with media become content-part arrays.
fn serialize_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut obj = json!({ "role": m.role });

            if !m.tool_calls.is_empty() {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": serde_json::to_string(&tc.arguments)
                                    .unwrap_or_else(|_| "{}".into()),
                            }
                        })
                    })
                    .collect();
                obj["tool_calls"] = json!(calls);
                // content must be null on assistant turns that only carry
                // tool calls.
                obj["content"] = if m.content.is_empty() {
                    Value::Null
                } else {
                    json!(m.content)
                };
            } else if !m.images.is_empty() || !m.files.is_empty() {
                let mut parts: Vec<Value> = Vec::new();
                if !m.content.is_empty() {
                    parts.push(json!({ "type": "text", "text": m.content }));
                }
                for img in &m.images {
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", img.media_type, img.data),
                        }
                    }));
                }
                for file in &m.files {
                    parts.push(json!({
                        "type": "file",
                        "file": {
                            "filename": file.name,
                            "file_data": format!("data:{};base64,{}", file.media_type, file.data),
                        }
                    }));
                }
                obj["content"] = json!(parts);
            } else {
                obj["content"] = json!(m.content);
            }

            if !m.tool_call_id.is_empty() {
                obj["tool_call_id"] = json!(m.tool_call_id);
            }
            obj
        })
        .collect()
}

/// Parse `tool_calls` out of a chat-completions response message.
fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|tc| {
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let raw_args = func.get("arguments").and_then(Value::as_str).unwrap_or("{}");
            let arguments = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));
            Some(ToolCall {
                id: tc
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name,
                arguments,
            })
        })
        .collect()
}

fn parse_usage(body: &Value) -> Option<UsageInfo> {
    let usage = body.get("usage")?;
    Some(UsageInfo {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    })
}

#[async_trait]
impl LLMProvider for OpenAiCompatProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        opts: &ChatOptions,
    ) -> Result<LLMResponse, ProviderError> {
        let mut body = json!({
            "model": model,
            "messages": serialize_messages(messages),
        });

        if !tools.is_empty() {
            let defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(defs);
        }
        if let Some(max) = opts.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(temp) = opts.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(key) = &opts.prompt_cache_key {
            body["prompt_cache_key"] = json!(key);
        }

        let mut request = self.client.post(self.endpoint()).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let resp = request.send().await.map_err(ProviderError::from_transport)?;
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

        let message = &parsed["choices"][0]["message"];
        let tool_calls = parse_tool_calls(message);
        let finish_reason = parsed["choices"][0]["finish_reason"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(LLMResponse {
            content: message["content"].as_str().unwrap_or_default().to_string(),
            reasoning_content: message["reasoning_content"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            tool_calls,
            finish_reason,
            usage: parse_usage(&parsed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_serialize_with_null_content() {
        let msgs = vec![Message {
            role: "assistant".into(),
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                name: "read_file".into(),
                arguments: json!({"path": "a.txt"}),
            }],
            ..Default::default()
        }];
        let out = serialize_messages(&msgs);
        assert!(out[0]["content"].is_null());
        assert_eq!(out[0]["tool_calls"][0]["function"]["name"], "read_file");
        // Arguments travel as a JSON string on the wire.
        assert!(out[0]["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn tool_result_carries_pairing_id() {
        let msgs = vec![Message {
            role: "tool".into(),
            content: "ok".into(),
            tool_call_id: "call_1".into(),
            ..Default::default()
        }];
        let out = serialize_messages(&msgs);
        assert_eq!(out[0]["tool_call_id"], "call_1");
        assert_eq!(out[0]["content"], "ok");
    }

    #[test]
    fn user_media_becomes_content_parts() {
        let msgs = vec![Message {
            role: "user".into(),
            content: "look".into(),
            images: vec![super::super::ImageBlock {
                media_type: "image/png".into(),
                data: "AAAA".into(),
            }],
            files: vec![super::super::FileBlock {
                name: "r.pdf".into(),
                media_type: "application/pdf".into(),
                data: "BBBB".into(),
            }],
            ..Default::default()
        }];
        let out = serialize_messages(&msgs);
        let parts = out[0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[2]["file"]["filename"], "r.pdf");
    }

    #[test]
    fn parses_tool_calls_with_string_arguments() {
        let message = json!({
            "tool_calls": [{
                "id": "c9",
                "type": "function",
                "function": {"name": "exec", "arguments": "{\"command\":\"ls\"}"}
            }]
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c9");
        assert_eq!(calls[0].arguments["command"], "ls");
    }
}
