use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Model => "model",
        }
    }
}

/// One round-trip through the tool server, kept on the model turn that
/// requested it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ToolCallRecord {
    pub tool: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn model(content: impl Into<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: TurnRole::Model,
            content: content.into(),
            tool_calls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
        }
    }
}

/// The shape advertised to the generative model for planning. Never carries
/// the command template; that binding stays inside the tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclaration {
    pub name: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: BTreeMap<String, ParamType>,
    #[serde(default = "message_schema")]
    pub output_schema: BTreeMap<String, ParamType>,
}

impl ToolDeclaration {
    pub fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        input_schema: BTreeMap<String, ParamType>,
    ) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            description: description.into(),
            input_schema,
            output_schema: message_schema(),
        }
    }
}

fn message_schema() -> BTreeMap<String, ParamType> {
    BTreeMap::from([("message".to_string(), ParamType::String)])
}

/// Tagged outcome of one tool invocation. The tag exists only inside the
/// process; both arms serialize to the identical wire envelope so the model
/// always receives a uniform result shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success { message: String },
    Failure { message: String },
}

impl ToolOutcome {
    pub fn message(&self) -> &str {
        match self {
            ToolOutcome::Success { message } | ToolOutcome::Failure { message } => message,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }
}

/// Wire request of the tool-invocation interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredContent {
    pub message: String,
}

/// Uniform result envelope for every tool call, success and failure alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    pub content: Vec<ContentBlock>,
    pub structured_content: StructuredContent,
}

impl ToolInvocationResult {
    pub fn from_outcome(outcome: &ToolOutcome) -> Self {
        Self::with_message(outcome.message())
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            content: vec![ContentBlock::Text {
                text: message.clone(),
            }],
            structured_content: StructuredContent { message },
        }
    }

    /// Text the model reasons about: the structured message.
    pub fn message(&self) -> &str {
        &self.structured_content.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serializes_to_mcp_shape() {
        let result = ToolInvocationResult::with_message("ON");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "content": [{"type": "text", "text": "ON"}],
                "structuredContent": {"message": "ON"}
            })
        );
    }

    #[test]
    fn success_and_failure_share_one_wire_shape() {
        let ok = ToolOutcome::Success {
            message: "device list".into(),
        };
        let failed = ToolOutcome::Failure {
            message: "device list".into(),
        };
        assert_eq!(
            serde_json::to_value(ToolInvocationResult::from_outcome(&ok)).unwrap(),
            serde_json::to_value(ToolInvocationResult::from_outcome(&failed)).unwrap(),
        );
    }

    #[test]
    fn declaration_pins_message_output_schema() {
        let declaration = ToolDeclaration::new(
            "list-devices",
            "List devices",
            "List every configured smart plug",
            BTreeMap::new(),
        );
        let value = serde_json::to_value(&declaration).unwrap();
        assert_eq!(value["inputSchema"], json!({}));
        assert_eq!(value["outputSchema"], json!({"message": "string"}));
    }

    #[test]
    fn turn_roles_round_trip_lowercase() {
        assert_eq!(serde_json::to_value(TurnRole::User).unwrap(), json!("user"));
        assert_eq!(
            serde_json::to_value(TurnRole::Model).unwrap(),
            json!("model")
        );
        let turn = ConversationTurn::model("done", Vec::new());
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value, json!({"role": "model", "content": "done"}));
    }
}
