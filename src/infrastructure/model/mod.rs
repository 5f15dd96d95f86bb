mod factory;
mod gemini;
mod ollama;

pub use factory::{build_provider, resolve_api_key};
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

use crate::domain::types::{ParamType, ToolDeclaration, TurnRole};

/// One piece of a model-visible message: plain text, a function call the
/// model issued, or the result we feed back for one.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelPart {
    Text(String),
    FunctionCall(FunctionCall),
    FunctionResponse { name: String, response: Value },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelContent {
    pub role: TurnRole,
    pub parts: Vec<ModelPart>,
}

impl ModelContent {
    pub fn text(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ModelPart::Text(content.into())],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: Option<String>,
    pub contents: Vec<ModelContent>,
    pub tools: Vec<ToolDeclaration>,
}

/// What the model decided: a final reply, or one batch of tool calls to
/// satisfy before asking again.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Text(String),
    FunctionCalls(Vec<FunctionCall>),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model provider '{provider}' is not supported")]
    ProviderNotFound { provider: String },
    #[error("API key environment variable '{variable}' is not set")]
    MissingApiKey { variable: String },
    #[error("network error from {provider}: {source}")]
    Network {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl ModelError {
    pub fn provider_not_found(provider: impl Into<String>) -> Self {
        ModelError::ProviderNotFound {
            provider: provider.into(),
        }
    }

    pub fn missing_api_key(variable: impl Into<String>) -> Self {
        ModelError::MissingApiKey {
            variable: variable.into(),
        }
    }

    pub fn network(provider: impl Into<String>, source: reqwest::Error) -> Self {
        ModelError::Network {
            provider: provider.into(),
            source,
        }
    }

    pub fn invalid_response(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        ModelError::InvalidResponse {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Text safe to hand to the mobile client; never leaks keys or URLs.
    pub fn user_message(&self) -> String {
        match self {
            ModelError::ProviderNotFound { .. } => {
                "The configured AI provider is not supported.".to_string()
            }
            ModelError::MissingApiKey { .. } => {
                "The AI service is not configured with an API key.".to_string()
            }
            ModelError::Network { source, .. } => {
                if source.is_connect() {
                    "Could not reach the AI service. Check that it is running and accessible."
                        .to_string()
                } else if source.is_timeout() {
                    "The AI service took too long to respond. Try again shortly.".to_string()
                } else if let Some(status) = source.status() {
                    match status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            "The AI service rejected our credentials.".to_string()
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            "The AI service is rate limiting requests. Try again later.".to_string()
                        }
                        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
                            "The AI service is currently unavailable. Try again later.".to_string()
                        }
                        _ => format!(
                            "The AI request failed with status {}. Try again later.",
                            status.as_u16()
                        ),
                    }
                } else {
                    "A network error occurred while contacting the AI service.".to_string()
                }
            }
            ModelError::InvalidResponse { .. } => {
                "The AI service returned a response that could not be processed. Try again."
                    .to_string()
            }
        }
    }
}

/// The opaque generative capability: text plus history plus declarations in,
/// a reply or a batch of tool calls out.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;
    async fn generate(&self, request: ModelRequest) -> Result<ModelReply, ModelError>;
}

/// Tool arguments travel as strings end to end; models occasionally emit
/// numbers or booleans, which are flattened here.
pub(crate) fn stringify_argument(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Declared input schema as the OpenAPI-style `parameters` object the
/// function-calling APIs expect; `None` for zero-argument tools.
pub(crate) fn schema_parameters(declaration: &ToolDeclaration) -> Option<Value> {
    if declaration.input_schema.is_empty() {
        return None;
    }
    let properties: serde_json::Map<String, Value> = declaration
        .input_schema
        .iter()
        .map(|(name, kind)| (name.clone(), json!({"type": kind.as_str()})))
        .collect();
    let required: Vec<&String> = declaration.input_schema.keys().collect();
    Some(json!({
        "type": "object",
        "properties": properties,
        "required": required,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_flatten_to_strings() {
        assert_eq!(stringify_argument(&json!("kitchen")), "kitchen");
        assert_eq!(stringify_argument(&json!(3)), "3");
        assert_eq!(stringify_argument(&json!(true)), "true");
    }

    #[test]
    fn zero_arg_tools_have_no_parameters_object() {
        let declaration = ToolDeclaration::new(
            "list-devices",
            "List devices",
            "List every configured smart plug",
            BTreeMap::new(),
        );
        assert_eq!(schema_parameters(&declaration), None);
    }

    #[test]
    fn single_string_param_becomes_required_property() {
        let declaration = ToolDeclaration::new(
            "device-state",
            "Device state",
            "Read the state of one smart plug",
            BTreeMap::from([("plugName".to_string(), ParamType::String)]),
        );
        let parameters = schema_parameters(&declaration).unwrap();
        assert_eq!(parameters["type"], "object");
        assert_eq!(parameters["properties"]["plugName"]["type"], "string");
        assert_eq!(parameters["required"], json!(["plugName"]));
    }
}
