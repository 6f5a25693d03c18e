// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::provider::ModelProvider;
use crate::types::{ChatMessage, ModelResponse, ToolCallRequest, ToolSpec};

/// Provider speaking the OpenAI-compatible chat-completions wire format.
/// Works against any local or hosted server exposing `/chat/completions`
/// under the configured base URL.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
        temperature: f32,
        max_tokens: u32,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = tools
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
        }
        body
    }
}

/// Tool-call arguments arrive as a JSON-encoded string; anything that does
/// not decode to an object is replaced with `{}` so downstream consumers can
/// rely on the shape.
fn parse_arguments(raw: Option<&Value>) -> Value {
    let decoded = match raw {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    match decoded {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(Map::new()),
    }
}

fn parse_response(body: &Value) -> ModelResponse {
    let message = &body["choices"][0]["message"];
    let text = message["content"].as_str().unwrap_or_default().to_string();
    let reasoning_text = message["reasoning_content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    Some(ToolCallRequest {
                        name,
                        arguments: parse_arguments(function.get("arguments")),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    ModelResponse {
        text,
        tool_calls,
        reasoning_text,
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<ModelResponse> {
        let mut request = self
            .client
            .post(self.endpoint("chat/completions"))
            .json(&self.request_body(messages, tools, temperature, max_tokens));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{}: request failed", self.name))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("{}: http {status}: {detail}", self.name);
        }
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("{}: invalid response body", self.name))?;
        Ok(parse_response(&body))
    }

    async fn health_check(&self) -> bool {
        let mut request = self.client.get(self.endpoint("models"));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        match request.timeout(Duration::from_secs(5)).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(provider = %self.name, error = %err, "health check failed");
                false
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_text_and_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "running it now",
                    "tool_calls": [{
                        "function": {
                            "name": "echo",
                            "arguments": "{\"text\": \"hi\"}",
                        }
                    }]
                }
            }]
        });
        let response = parse_response(&body);
        assert_eq!(response.text, "running it now");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "echo");
        assert_eq!(response.tool_calls[0].arguments["text"], "hi");
    }

    #[test]
    fn malformed_arguments_become_an_empty_object() {
        assert_eq!(
            parse_arguments(Some(&json!("not json"))),
            json!({})
        );
        assert_eq!(parse_arguments(Some(&json!([1, 2]))), json!({}));
        assert_eq!(parse_arguments(None), json!({}));
    }

    #[test]
    fn object_arguments_pass_through() {
        assert_eq!(
            parse_arguments(Some(&json!({"a": 1}))),
            json!({"a": 1})
        );
    }

    #[test]
    fn empty_choices_yield_empty_response() {
        let response = parse_response(&json!({"choices": []}));
        assert!(response.text.is_empty());
        assert!(response.tool_calls.is_empty());
    }

    #[test]
    fn request_body_includes_tools_when_present() {
        let provider = OpenAiCompatProvider::new("p", "http://localhost:9", "m", None);
        let tools = vec![ToolSpec {
            name: "echo".to_string(),
            description: "Echo".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }];
        let body = provider.request_body(&[ChatMessage::user("x")], Some(tools.as_slice()), 0.7, 256);
        assert_eq!(body["tools"][0]["function"]["name"], "echo");
        let body = provider.request_body(&[ChatMessage::user("x")], None, 0.7, 256);
        assert!(body.get("tools").is_none());
    }
}
