use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::ServerError;
use crate::application::executor::CommandExecutor;
use crate::application::registry::ToolRegistry;
use crate::domain::types::{
    ToolDeclaration, ToolInvocationRequest, ToolInvocationResult, ToolOutcome,
};

/// The protocol responder: resolves a named tool, validates its arguments,
/// runs the bound command, and answers with the uniform result envelope.
/// Holds no per-client state; every request stands alone.
pub struct ToolServerState {
    registry: Arc<ToolRegistry>,
    executor: CommandExecutor,
}

impl ToolServerState {
    pub fn new(registry: Arc<ToolRegistry>, executor: CommandExecutor) -> Self {
        Self { registry, executor }
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.registry.list()
    }

    /// Every path out of here is a result envelope. Unknown tools and bad
    /// arguments look exactly like failed commands on the wire; the model
    /// treats all three as information, not as protocol faults.
    pub async fn handle_invocation(
        &self,
        tool_name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> ToolInvocationResult {
        let outcome = self.run_tool(tool_name, arguments).await;
        info!(
            tool = tool_name,
            success = outcome.is_success(),
            "Tool invocation finished"
        );
        ToolInvocationResult::from_outcome(&outcome)
    }

    async fn run_tool(&self, tool_name: &str, arguments: &BTreeMap<String, String>) -> ToolOutcome {
        let Some(descriptor) = self.registry.resolve(tool_name) else {
            warn!(tool = tool_name, "Invocation names an unregistered tool");
            return ToolOutcome::Failure {
                message: format!("unknown tool '{tool_name}'"),
            };
        };

        // Only the declared argument is read; extras are ignored.
        let argument = match descriptor.required_param() {
            Some(param) => match arguments.get(param) {
                Some(value) => Some(value.as_str()),
                None => {
                    warn!(tool = tool_name, param, "Invocation missing required argument");
                    return ToolOutcome::Failure {
                        message: format!(
                            "missing required argument '{param}' for tool '{tool_name}'"
                        ),
                    };
                }
            },
            None => None,
        };

        match self.executor.execute(&descriptor.template, argument).await {
            Ok(output) => ToolOutcome::Success { message: output },
            Err(failure) => ToolOutcome::Failure {
                message: failure.to_string(),
            },
        }
    }
}

pub fn build_router(state: Arc<ToolServerState>) -> Router {
    Router::new()
        .route("/invoke", post(invoke_handler))
        .route("/tools", get(tools_handler))
        .with_state(state)
}

pub async fn serve(state: Arc<ToolServerState>, addr: SocketAddr) -> Result<(), ServerError> {
    info!(%addr, tools = state.registry.len(), "Binding tool server");
    let app = build_router(state);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "Tool server ready to accept connections");
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(ServerError::Serve)
}

async fn invoke_handler(
    State(state): State<Arc<ToolServerState>>,
    Json(request): Json<ToolInvocationRequest>,
) -> Json<ToolInvocationResult> {
    debug!(tool = %request.tool_name, "Received /invoke request");
    Json(
        state
            .handle_invocation(&request.tool_name, &request.arguments)
            .await,
    )
}

async fn tools_handler(State(state): State<Arc<ToolServerState>>) -> Json<Vec<ToolDeclaration>> {
    let declarations = state.declarations();
    debug!(tool_count = declarations.len(), "Serving /tools request");
    Json(declarations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSpec;
    use crate::domain::types::ParamType;
    use std::time::Duration;

    fn state(specs: &[ToolSpec]) -> ToolServerState {
        let registry = ToolRegistry::from_specs(specs).expect("valid specs");
        ToolServerState::new(
            Arc::new(registry),
            CommandExecutor::new(Duration::from_secs(5)),
        )
    }

    fn echo_state_tool() -> ToolSpec {
        ToolSpec {
            name: "device-state".to_string(),
            title: Some("Device state".to_string()),
            description: Some("Read the on/off state of one smart plug".to_string()),
            command: "echo state <plugName>".to_string(),
            input: BTreeMap::from([("plugName".to_string(), ParamType::String)]),
        }
    }

    #[tokio::test]
    async fn unknown_tool_returns_failure_envelope() {
        let state = state(&[]);
        let result = state.handle_invocation("no-such-tool", &BTreeMap::new()).await;
        assert!(!result.message().is_empty());
        assert!(result.message().contains("no-such-tool"));
    }

    #[tokio::test]
    async fn missing_argument_returns_failure_envelope() {
        let state = state(&[echo_state_tool()]);
        let result = state.handle_invocation("device-state", &BTreeMap::new()).await;
        assert!(result.message().contains("plugName"));
    }

    #[tokio::test]
    async fn extra_arguments_are_ignored() {
        let state = state(&[echo_state_tool()]);
        let arguments = BTreeMap::from([
            ("plugName".to_string(), "kitchen".to_string()),
            ("verbose".to_string(), "yes".to_string()),
        ]);
        let result = state.handle_invocation("device-state", &arguments).await;
        assert_eq!(result.message(), "state kitchen");
    }

    #[tokio::test]
    async fn executor_failure_text_reaches_the_envelope_unchanged() {
        let spec = ToolSpec {
            name: "always-fails".to_string(),
            title: None,
            description: None,
            command: "false".to_string(),
            input: BTreeMap::new(),
        };
        let state = state(&[spec]);
        let result = state.handle_invocation("always-fails", &BTreeMap::new()).await;
        assert_eq!(result.message(), "command exited with status 1");
    }

    #[tokio::test]
    async fn declarations_match_registry_order() {
        let state = state(&[echo_state_tool()]);
        let declarations = state.declarations();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].name, "device-state");
    }
}
