use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, DEFAULT_SYSTEM_PROMPT};
use crate::domain::types::{ConversationTurn, ToolCallRecord, ToolDeclaration, TurnRole};
use crate::infrastructure::bridge::{BridgeError, ToolInvoker};
use crate::infrastructure::model::{
    ModelContent, ModelError, ModelPart, ModelProvider, ModelReply, ModelRequest,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("chat request timed out after {}s", limit.as_secs())]
    Timeout { limit: Duration },
    #[error("model did not reach a final reply within {limit} tool steps")]
    ToolLoopExhausted { limit: usize },
}

impl GatewayError {
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Model(error) => error.user_message(),
            GatewayError::Timeout { .. } => {
                "The assistant took too long to answer. The conversation is unchanged; try again."
                    .to_string()
            }
            GatewayError::ToolLoopExhausted { .. } => {
                "The assistant could not settle on an answer after running device commands. \
                 The conversation is unchanged; try again."
                    .to_string()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub model: String,
    pub system_prompt: String,
    pub max_tool_steps: usize,
    pub request_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tool_steps: 8,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl GatewayOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.model.name.clone(),
            system_prompt: config.model.system_prompt().to_string(),
            max_tool_steps: config.gateway.max_tool_steps,
            request_timeout: config.gateway.request_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub session_id: String,
    pub message: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

type History = Arc<Mutex<Vec<ConversationTurn>>>;

/// Owns every conversation. A turn is either committed whole (user turn plus
/// model turn) or rolled back whole; callers never observe a half-finished
/// exchange.
pub struct ChatGateway {
    provider: Arc<dyn ModelProvider>,
    bridge: Arc<dyn ToolInvoker>,
    declarations: Vec<ToolDeclaration>,
    options: GatewayOptions,
    // Outer lock guards only the map; the per-session lock is held across
    // the whole turn so same-session requests serialize while different
    // sessions proceed in parallel.
    sessions: Mutex<HashMap<String, History>>,
}

impl ChatGateway {
    /// Fetches the tool declarations from the tool server, then builds the
    /// gateway around them. Declarations are immutable afterwards.
    pub async fn connect(
        provider: Arc<dyn ModelProvider>,
        bridge: Arc<dyn ToolInvoker>,
        options: GatewayOptions,
    ) -> Result<Self, BridgeError> {
        let declarations = bridge.declarations().await?;
        info!(
            tool_count = declarations.len(),
            model = options.model.as_str(),
            "Gateway connected to tool server"
        );
        Ok(Self::new(provider, bridge, declarations, options))
    }

    pub fn new(
        provider: Arc<dyn ModelProvider>,
        bridge: Arc<dyn ToolInvoker>,
        declarations: Vec<ToolDeclaration>,
        options: GatewayOptions,
    ) -> Self {
        Self {
            provider,
            bridge,
            declarations,
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.declarations
    }

    /// One full turn: tentatively append the user text, let the model plan
    /// and run tool calls, then commit its final reply. Any model-side
    /// failure or timeout restores the history to exactly what it was.
    pub async fn converse(
        &self,
        session_id: Option<String>,
        text: String,
    ) -> Result<ChatOutcome, GatewayError> {
        let session_id = session_id.unwrap_or_else(new_session_id);
        let session = self.session(&session_id).await;
        let mut history = session.lock().await;

        let baseline = history.len();
        history.push(ConversationTurn::user(text));
        debug!(
            session_id = session_id.as_str(),
            history = history.len(),
            "Appended tentative user turn"
        );

        let limit = self.options.request_timeout;
        let result = timeout(limit, self.drive_model(history.as_slice())).await;
        match result {
            Ok(Ok((message, tool_calls))) => {
                history.push(ConversationTurn::model(message.clone(), tool_calls.clone()));
                info!(
                    session_id = session_id.as_str(),
                    turns = history.len(),
                    tool_calls = tool_calls.len(),
                    "Committed conversation turn"
                );
                Ok(ChatOutcome {
                    session_id,
                    message,
                    tool_calls,
                })
            }
            Ok(Err(failure)) => {
                history.truncate(baseline);
                error!(
                    session_id = session_id.as_str(),
                    error = %failure,
                    "Model invocation failed; turn rolled back"
                );
                Err(failure)
            }
            Err(_elapsed) => {
                history.truncate(baseline);
                warn!(
                    session_id = session_id.as_str(),
                    timeout_secs = limit.as_secs(),
                    "Chat request timed out; turn rolled back"
                );
                Err(GatewayError::Timeout { limit })
            }
        }
    }

    /// Drops one session's history, or every session's when no id is given.
    /// Safe to call repeatedly.
    pub async fn reset(&self, session_id: Option<&str>) {
        let mut sessions = self.sessions.lock().await;
        match session_id {
            Some(id) => {
                sessions.remove(id);
                info!(session_id = id, "Cleared conversation history");
            }
            None => {
                let session_count = sessions.len();
                sessions.clear();
                info!(session_count, "Cleared all conversation histories");
            }
        }
    }

    async fn session(&self, session_id: &str) -> History {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    /// The model round-trip loop: re-invoke the model after each batch of
    /// tool calls until it produces text, bounded by the step budget. Tool
    /// failures are data and keep the loop going; only the model call
    /// itself can fail out of here.
    async fn drive_model(
        &self,
        turns: &[ConversationTurn],
    ) -> Result<(String, Vec<ToolCallRecord>), GatewayError> {
        let mut contents: Vec<ModelContent> = turns
            .iter()
            .map(|turn| ModelContent::text(turn.role, turn.content.clone()))
            .collect();
        let mut records: Vec<ToolCallRecord> = Vec::new();

        for step in 0..self.options.max_tool_steps {
            let request = ModelRequest {
                model: self.options.model.clone(),
                system: Some(self.options.system_prompt.clone()),
                contents: contents.clone(),
                tools: self.declarations.clone(),
            };
            match self.provider.generate(request).await? {
                ModelReply::Text(message) => {
                    debug!(steps = step, "Model produced final reply");
                    return Ok((message, records));
                }
                ModelReply::FunctionCalls(calls) => {
                    debug!(step, calls = calls.len(), "Model requested tool calls");
                    contents.push(ModelContent {
                        role: TurnRole::Model,
                        parts: calls
                            .iter()
                            .cloned()
                            .map(ModelPart::FunctionCall)
                            .collect(),
                    });

                    let mut responses = Vec::with_capacity(calls.len());
                    for call in calls {
                        let result = self.bridge.invoke(&call.name, &call.arguments).await;
                        let message = result.message().to_string();
                        info!(tool = call.name.as_str(), "Tool round-trip completed");
                        records.push(ToolCallRecord {
                            tool: call.name.clone(),
                            arguments: call.arguments.clone(),
                            message: message.clone(),
                        });
                        responses.push(ModelPart::FunctionResponse {
                            name: call.name,
                            response: json!({ "message": message }),
                        });
                    }
                    contents.push(ModelContent {
                        role: TurnRole::User,
                        parts: responses,
                    });
                }
            }
        }

        warn!(
            limit = self.options.max_tool_steps,
            "Tool loop exhausted without a final reply"
        );
        Err(GatewayError::ToolLoopExhausted {
            limit: self.options.max_tool_steps,
        })
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
