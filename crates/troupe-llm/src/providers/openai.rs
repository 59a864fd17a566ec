use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use troupe_core::config::BackendConfig;
use troupe_core::error::{BackendError, Result};
use troupe_core::traits::GenerationBackend;
use troupe_core::types::{GenerationRequest, ToolDefinition};
use troupe_tools::ToolRegistry;

use super::{classify_status, classify_transport};
use crate::toolcall::{execute_tool_calls, PendingToolCall};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible backend. Works with OpenAI, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiBackend {
    config: BackendConfig,
    registry: Arc<ToolRegistry>,
    http: Client,
}

impl OpenAiBackend {
    pub fn new(config: BackendConfig, registry: Arc<ToolRegistry>) -> Self {
        Self {
            config,
            registry,
            http: Client::new(),
        }
    }

    async fn send_chat(&self, messages: &[OaiMessage], tools: &[OaiTool]) -> Result<ResponseMessage> {
        let body = ChatRequest {
            model: self.config.model_id.clone(),
            messages: messages.to_vec(),
            max_tokens: self.config.max_tokens,
            temperature: (self.config.temperature > 0.0).then_some(self.config.temperature),
            tools: tools.to_vec(),
        };

        let url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
        let mut req = self.http.post(url).json(&body);

        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req.send().await.map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(classify_status(status, &body).into());
        }

        let parsed: ChatResponse = response.json().await.map_err(classify_transport)?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| BackendError::Fatal("Response contained no choices".into()).into())
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct OaiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OaiMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_response(call_id: &str, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct OaiToolCall {
    #[serde(default)]
    id: String,
    #[serde(default)]
    r#type: String,
    function: OaiFunction,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct OaiFunction {
    name: String,
    arguments: String,
}

#[derive(Serialize, Clone)]
pub(crate) struct OaiTool {
    r#type: String,
    function: OaiToolDef,
}

#[derive(Serialize, Clone)]
pub(crate) struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaiToolCall>>,
}

pub(crate) fn convert_tools(tools: &[ToolDefinition]) -> Vec<OaiTool> {
    tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function".to_string(),
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

impl GenerationBackend for OpenAiBackend {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let tools = convert_tools(&request.tools);
            let mut messages = Vec::with_capacity(4);
            if !request.system.is_empty() {
                messages.push(OaiMessage::text("system", &request.system));
            }
            messages.push(OaiMessage::text("user", &request.prompt));

            let max_rounds = self.config.max_tool_rounds;
            let mut round = 0;
            loop {
                // The last round withholds tools so the model must answer.
                let offer_tools = round < max_rounds;
                let reply = self
                    .send_chat(&messages, if offer_tools { &tools } else { &[] })
                    .await?;

                let calls = reply.tool_calls.unwrap_or_default();
                if calls.is_empty() || !offer_tools {
                    return Ok(reply.content.unwrap_or_default());
                }

                debug!(
                    agent = %request.agent_id,
                    round,
                    calls = calls.len(),
                    "Model requested tool calls"
                );

                messages.push(OaiMessage {
                    role: "assistant".to_string(),
                    content: reply.content,
                    tool_calls: Some(calls.clone()),
                    tool_call_id: None,
                });

                let pending: Vec<PendingToolCall> = calls
                    .into_iter()
                    .map(|tc| PendingToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        input: serde_json::from_str(&tc.function.arguments)
                            .unwrap_or(serde_json::Value::Null),
                    })
                    .collect();

                let results = execute_tool_calls(&self.registry, &request.tools, pending).await;
                for (call, result) in results {
                    let content = if result.is_error {
                        format!("ERROR: {}", result.content)
                    } else {
                        result.content
                    };
                    messages.push(OaiMessage::tool_response(&call.id, content));
                }

                round += 1;
            }
        })
    }
}
