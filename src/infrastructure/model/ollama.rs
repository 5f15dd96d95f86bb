use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{
    FunctionCall, ModelError, ModelPart, ModelProvider, ModelReply, ModelRequest,
    schema_parameters, stringify_argument,
};
use crate::domain::types::TurnRole;

/// Ollama `/api/chat` with tool support; no auth, intended for a local
/// instance.
#[derive(Clone)]
pub struct OllamaProvider {
    http: Client,
    endpoint: String,
}

impl OllamaProvider {
    pub fn from_config(config: &crate::config::ModelConfig) -> Self {
        Self::new(config.endpoint())
    }

    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
        }
    }

    fn chat_url(&self) -> String {
        let base = self.endpoint.trim_end_matches('/');
        format!("{base}/api/chat")
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn id(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelReply, ModelError> {
        let url = self.chat_url();
        let payload = build_payload(&request);

        info!(
            provider = self.id(),
            model = request.model.as_str(),
            contents = request.contents.len(),
            tools = request.tools.len(),
            "Sending request to Ollama"
        );

        let response: OllamaResponse = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ModelError::network(self.id(), e))?
            .error_for_status()
            .map_err(|e| ModelError::network(self.id(), e))?
            .json()
            .await
            .map_err(|e| ModelError::network(self.id(), e))?;
        debug!("Received response from Ollama");

        reply_from(response, self.id())
    }
}

fn build_payload(request: &ModelRequest) -> Value {
    let mut payload = json!({
        "model": request.model,
        "messages": build_messages(request),
        "stream": false,
    });

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                let mut function = json!({
                    "name": tool.name,
                    "description": tool.description,
                });
                if let Some(parameters) = schema_parameters(tool) {
                    function["parameters"] = parameters;
                }
                json!({"type": "function", "function": function})
            })
            .collect();
        payload["tools"] = json!(tools);
    }

    payload
}

/// Flattens role-tagged contents into Ollama's message list. Function calls
/// ride on an assistant message; each function response becomes one `tool`
/// message.
fn build_messages(request: &ModelRequest) -> Vec<Value> {
    let mut messages = Vec::with_capacity(request.contents.len() + 1);
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }

    for content in &request.contents {
        let calls: Vec<Value> = content
            .parts
            .iter()
            .filter_map(|part| match part {
                ModelPart::FunctionCall(call) => Some(json!({
                    "function": {"name": call.name, "arguments": call.arguments}
                })),
                _ => None,
            })
            .collect();
        if !calls.is_empty() {
            messages.push(json!({"role": "assistant", "content": "", "tool_calls": calls}));
            continue;
        }

        let mut emitted_response = false;
        for part in &content.parts {
            if let ModelPart::FunctionResponse { name, response } = part {
                let text = response
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| response.to_string());
                messages.push(json!({"role": "tool", "tool_name": name, "content": text}));
                emitted_response = true;
            }
        }
        if emitted_response {
            continue;
        }

        let text: String = content
            .parts
            .iter()
            .filter_map(|part| match part {
                ModelPart::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        let role = match content.role {
            TurnRole::User => "user",
            TurnRole::Model => "assistant",
        };
        messages.push(json!({"role": role, "content": text}));
    }

    messages
}

fn reply_from(response: OllamaResponse, provider: &str) -> Result<ModelReply, ModelError> {
    let message = response
        .message
        .ok_or_else(|| ModelError::invalid_response(provider, "missing message"))?;

    let calls: Vec<FunctionCall> = message
        .tool_calls
        .into_iter()
        .map(|call| FunctionCall {
            name: call.function.name,
            arguments: call
                .function
                .arguments
                .iter()
                .map(|(name, value)| (name.clone(), stringify_argument(value)))
                .collect(),
        })
        .collect();
    if !calls.is_empty() {
        return Ok(ModelReply::FunctionCalls(calls));
    }

    if message.content.is_empty() {
        return Err(ModelError::invalid_response(
            provider,
            "empty message content",
        ));
    }
    Ok(ModelReply::Text(message.content))
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: Option<OllamaMessage>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}
