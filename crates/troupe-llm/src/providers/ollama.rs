use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use troupe_core::config::BackendConfig;
use troupe_core::error::Result;
use troupe_core::traits::GenerationBackend;
use troupe_core::types::GenerationRequest;
use troupe_tools::ToolRegistry;

use super::{classify_status, classify_transport};
use crate::providers::openai::convert_tools;
use crate::toolcall::{execute_tool_calls, PendingToolCall};

const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Backend for a local Ollama instance.
pub struct OllamaBackend {
    config: BackendConfig,
    registry: Arc<ToolRegistry>,
    http: Client,
}

impl OllamaBackend {
    pub fn new(config: BackendConfig, registry: Arc<ToolRegistry>) -> Self {
        Self {
            config,
            registry,
            http: Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(OLLAMA_BASE_URL);
        format!("{}/api/chat", base.trim_end_matches('/'))
    }

    async fn send_chat(
        &self,
        messages: &[OllamaMessage],
        tools: &[super::openai::OaiTool],
    ) -> Result<OllamaMessage> {
        let body = ChatRequest {
            model: self.config.model_id.clone(),
            messages: messages.to_vec(),
            stream: false,
            tools: tools.to_vec(),
            options: Options {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };

        let response = self
            .http
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(classify_status(status, &body).into());
        }

        let parsed: ChatResponse = response.json().await.map_err(classify_transport)?;
        Ok(parsed.message)
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<super::openai::OaiTool>,
    options: Options,
}

#[derive(Serialize)]
struct Options {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

impl OllamaMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: OllamaMessage,
}

/// Drop `<think>` blocks emitted by reasoning models such as deepseek-r1.
fn strip_reasoning(content: &str) -> String {
    let mut text = content.to_string();
    while let Some(start) = text.find("<think>") {
        match text[start..].find("</think>") {
            Some(end) => text.replace_range(start..start + end + "</think>".len(), ""),
            None => {
                text.truncate(start);
                break;
            }
        }
    }
    text.trim().to_string()
}

impl GenerationBackend for OllamaBackend {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let tools = convert_tools(&request.tools);
            let mut messages = Vec::with_capacity(4);
            if !request.system.is_empty() {
                messages.push(OllamaMessage::text("system", &request.system));
            }
            messages.push(OllamaMessage::text("user", &request.prompt));

            let max_rounds = self.config.max_tool_rounds;
            let mut round = 0;
            loop {
                let offer_tools = round < max_rounds;
                let reply = self
                    .send_chat(&messages, if offer_tools { &tools } else { &[] })
                    .await?;

                let calls = reply.tool_calls.clone().unwrap_or_default();
                if calls.is_empty() || !offer_tools {
                    return Ok(strip_reasoning(&reply.content));
                }

                debug!(
                    agent = %request.agent_id,
                    round,
                    calls = calls.len(),
                    "Model requested tool calls"
                );

                messages.push(reply);

                let pending: Vec<PendingToolCall> = calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, tc)| PendingToolCall {
                        // Ollama tool calls carry no id; synthesize one for logging.
                        id: format!("call_{}", i),
                        name: tc.function.name,
                        input: tc.function.arguments,
                    })
                    .collect();

                let results = execute_tool_calls(&self.registry, &request.tools, pending).await;
                for (_, result) in results {
                    let content = if result.is_error {
                        format!("ERROR: {}", result.content)
                    } else {
                        result.content
                    };
                    messages.push(OllamaMessage::text("tool", content));
                }

                round += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_reasoning() {
        assert_eq!(
            strip_reasoning("<think>step by step</think>The answer is 4."),
            "The answer is 4."
        );
        assert_eq!(strip_reasoning("no reasoning here"), "no reasoning here");
        // Unterminated block: drop everything from the open tag.
        assert_eq!(strip_reasoning("before <think>dangling"), "before");
    }

    #[test]
    fn test_parse_tool_call_response() {
        let raw = r#"{
            "model": "deepseek-r1",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "web_search", "arguments": {"query": "rust"}}}]
            },
            "done": true
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let calls = parsed.message.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "web_search");
        assert_eq!(calls[0].function.arguments["query"], "rust");
    }
}
