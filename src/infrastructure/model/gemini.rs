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

const API_PATH: &str = "v1beta/models";

/// Google Gemini over the `generateContent` REST API, with function
/// declarations so the model can plan tool calls.
#[derive(Clone)]
pub struct GeminiProvider {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    key_variable: String,
}

impl GeminiProvider {
    pub fn from_config(config: &crate::config::ModelConfig) -> Self {
        let api_key = super::resolve_api_key("gemini", &config.api_key_env);
        Self::new(config.endpoint(), api_key, config.api_key_env.clone())
    }

    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        key_variable: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            api_key,
            key_variable: key_variable.into(),
        }
    }

    fn model_url(&self, model: &str) -> String {
        let base = self.endpoint.trim_end_matches('/');
        format!("{base}/{API_PATH}/{model}:generateContent")
    }

    fn require_api_key(&self) -> Result<&str, ModelError> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ModelError::missing_api_key(&self.key_variable))
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelReply, ModelError> {
        let url = self.model_url(&request.model);
        let api_key = self.require_api_key()?;
        let payload = build_payload(&request);

        info!(
            provider = self.id(),
            model = request.model.as_str(),
            contents = request.contents.len(),
            tools = request.tools.len(),
            "Sending request to Gemini"
        );

        let response: GeminiResponse = self
            .http
            .post(format!("{url}?key={api_key}"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ModelError::network(self.id(), e))?
            .error_for_status()
            .map_err(|e| ModelError::network(self.id(), e))?
            .json()
            .await
            .map_err(|e| ModelError::network(self.id(), e))?;
        debug!("Received response from Gemini");

        reply_from(response, self.id())
    }
}

fn build_payload(request: &ModelRequest) -> Value {
    let contents: Vec<Value> = request.contents.iter().map(content_to_json).collect();

    let mut payload = json!({ "contents": contents });

    if let Some(system) = &request.system {
        payload["systemInstruction"] = json!({"parts": [{"text": system}]});
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                let mut declaration = json!({
                    "name": tool.name,
                    "description": tool.description,
                });
                if let Some(parameters) = schema_parameters(tool) {
                    declaration["parameters"] = parameters;
                }
                declaration
            })
            .collect();
        payload["tools"] = json!([{"functionDeclarations": declarations}]);
    }

    payload
}

fn content_to_json(content: &super::ModelContent) -> Value {
    let parts: Vec<Value> = content
        .parts
        .iter()
        .map(|part| match part {
            ModelPart::Text(text) => json!({"text": text}),
            ModelPart::FunctionCall(call) => json!({
                "functionCall": {"name": call.name, "args": call.arguments}
            }),
            ModelPart::FunctionResponse { name, response } => json!({
                "functionResponse": {"name": name, "response": response}
            }),
        })
        .collect();
    json!({"role": content.role.as_str(), "parts": parts})
}

fn reply_from(response: GeminiResponse, provider: &str) -> Result<ModelReply, ModelError> {
    let parts = response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .flat_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .collect::<Vec<_>>();

    let calls: Vec<FunctionCall> = parts
        .iter()
        .filter_map(|part| part.function_call.as_ref())
        .map(|call| FunctionCall {
            name: call.name.clone(),
            arguments: call
                .args
                .as_ref()
                .map(arguments_from)
                .unwrap_or_default(),
        })
        .collect();
    if !calls.is_empty() {
        return Ok(ModelReply::FunctionCalls(calls));
    }

    let text = parts
        .into_iter()
        .filter_map(|part| part.text)
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        return Err(ModelError::invalid_response(
            provider,
            "no text or function call in candidates",
        ));
    }
    Ok(ModelReply::Text(text))
}

fn arguments_from(args: &Map<String, Value>) -> std::collections::BTreeMap<String, String> {
    args.iter()
        .map(|(name, value)| (name.clone(), stringify_argument(value)))
        .collect()
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::super::ModelContent;
    use super::*;
    use crate::domain::types::{ParamType, ToolDeclaration};
    use std::collections::BTreeMap;

    fn request_with_tools() -> ModelRequest {
        ModelRequest {
            model: "gemini-2.5-flash".into(),
            system: Some("You control smart plugs.".into()),
            contents: vec![ModelContent::text(TurnRole::User, "is the kitchen plug on?")],
            tools: vec![ToolDeclaration::new(
                "device-state",
                "Device state",
                "Read the on/off state of one smart plug",
                BTreeMap::from([("plugName".to_string(), ParamType::String)]),
            )],
        }
    }

    #[test]
    fn model_url_embeds_api_path_and_model() {
        let provider = GeminiProvider::new(
            "https://generativelanguage.googleapis.com/",
            None,
            "GEMINI_API_KEY",
        );
        assert_eq!(
            provider.model_url("gemini-2.5-flash"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn missing_key_is_reported_before_any_network_call() {
        let provider = GeminiProvider::new("https://example.invalid", None, "GEMINI_API_KEY");
        let error = provider.require_api_key().unwrap_err();
        assert!(matches!(error, ModelError::MissingApiKey { variable } if variable == "GEMINI_API_KEY"));
    }

    #[test]
    fn payload_carries_system_tools_and_roles() {
        let payload = build_payload(&request_with_tools());
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            "You control smart plugs."
        );
        assert_eq!(payload["contents"][0]["role"], "user");
        let declaration = &payload["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "device-state");
        assert_eq!(
            declaration["parameters"]["properties"]["plugName"]["type"],
            "string"
        );
    }

    #[test]
    fn function_response_parts_round_trip_under_user_role() {
        let content = ModelContent {
            role: TurnRole::User,
            parts: vec![ModelPart::FunctionResponse {
                name: "device-state".into(),
                response: serde_json::json!({"message": "ON"}),
            }],
        };
        let value = content_to_json(&content);
        assert_eq!(value["role"], "user");
        assert_eq!(
            value["parts"][0]["functionResponse"]["response"]["message"],
            "ON"
        );
    }

    #[test]
    fn decodes_function_call_reply() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"functionCall": {"name": "device-state", "args": {"plugName": "kitchen"}}}]
                }
            }]
        });
        let response: GeminiResponse = serde_json::from_value(raw).unwrap();
        match reply_from(response, "gemini").unwrap() {
            ModelReply::FunctionCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "device-state");
                assert_eq!(calls[0].arguments["plugName"], "kitchen");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn decodes_text_reply() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "The kitchen plug is ON."}]}
            }]
        });
        let response: GeminiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(
            reply_from(response, "gemini").unwrap(),
            ModelReply::Text("The kitchen plug is ON.".into())
        );
    }

    #[test]
    fn empty_candidates_are_invalid() {
        let response: GeminiResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        let error = reply_from(response, "gemini").unwrap_err();
        assert!(matches!(error, ModelError::InvalidResponse { .. }));
    }
}
