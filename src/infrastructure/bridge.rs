use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::types::{ToolDeclaration, ToolInvocationRequest, ToolInvocationResult};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to fetch tool declarations from {url}: {source}")]
    Declarations {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// The orchestrator's view of the tool server. `invoke` is infallible on
/// purpose: transport trouble between gateway and tool server becomes a
/// failure-shaped envelope, so the model always has something to reason
/// about. Only the startup declaration fetch may fail hard.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn declarations(&self) -> Result<Vec<ToolDeclaration>, BridgeError>;
    async fn invoke(
        &self,
        tool_name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> ToolInvocationResult;
}

/// HTTP bridge to a tool server, local or remote.
pub struct HttpToolBridge {
    http: Client,
    base_url: String,
}

impl HttpToolBridge {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{trimmed}/{path}")
    }
}

#[async_trait]
impl ToolInvoker for HttpToolBridge {
    async fn declarations(&self) -> Result<Vec<ToolDeclaration>, BridgeError> {
        let url = self.endpoint("/tools");
        info!(url = %url, "Fetching tool declarations");
        let declarations: Vec<ToolDeclaration> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| BridgeError::Declarations {
                url: url.clone(),
                source,
            })?
            .error_for_status()
            .map_err(|source| BridgeError::Declarations {
                url: url.clone(),
                source,
            })?
            .json()
            .await
            .map_err(|source| BridgeError::Declarations {
                url: url.clone(),
                source,
            })?;
        info!(tool_count = declarations.len(), "Tool declarations loaded");
        Ok(declarations)
    }

    async fn invoke(
        &self,
        tool_name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> ToolInvocationResult {
        let url = self.endpoint("/invoke");
        let request = ToolInvocationRequest {
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
        };
        debug!(tool = tool_name, url = %url, "Forwarding tool invocation");

        let sent = self.http.post(&url).json(&request).send().await;
        let result = match sent {
            Ok(response) => match response.error_for_status() {
                Ok(response) => response.json::<ToolInvocationResult>().await,
                Err(source) => Err(source),
            },
            Err(source) => Err(source),
        };

        match result {
            Ok(envelope) => envelope,
            Err(source) => {
                warn!(tool = tool_name, %source, "Tool invocation transport failed");
                ToolInvocationResult::with_message(format!(
                    "tool invocation transport failed: {source}"
                ))
            }
        }
    }
}
