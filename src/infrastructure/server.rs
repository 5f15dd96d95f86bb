use crate::application::gateway::{ChatGateway, GatewayError};
use crate::domain::types::{ParamType, ToolCallRecord, ToolDeclaration};
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use super::ServerError;

pub struct ServerState {
    gateway: Arc<ChatGateway>,
}

impl ServerState {
    pub fn new(gateway: Arc<ChatGateway>) -> Self {
        Self { gateway }
    }

    fn gateway(&self) -> Arc<ChatGateway> {
        Arc::clone(&self.gateway)
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(chat_handler, reset_handler, tools_handler),
    components(
        schemas(
            ChatRequest,
            ChatResponse,
            ErrorResponse,
            ResetRequest,
            ResetResponse,
            ToolDeclaration,
            ToolCallRecord,
            ParamType
        )
    ),
    tags(
        (name = "chat", description = "Conversations with the device assistant"),
        (name = "tools", description = "Tools the gateway advertises to the model")
    )
)]
struct ApiDoc;

pub fn build_router(state: Arc<ServerState>) -> Router {
    // Callers are phone apps and local frontends, so the gateway stays open
    // to any origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(chat_handler))
        .route("/reset", post(reset_handler))
        .route("/tools", get(tools_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<ServerState>, addr: SocketAddr) -> Result<(), ServerError> {
    let api = ApiDoc::openapi();
    info!(%addr, "Binding gateway server");

    let app = build_router(state).merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", api));

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "Gateway server ready to accept connections");

    axum::serve(listener, app.into_make_service())
        .await
        .map_err(ServerError::Serve)
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    // Defaulted so an omitted field reaches the blank-text check instead of
    // a deserialization rejection.
    #[serde(default)]
    text: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    message: String,
    session_id: String,
    tool_calls: Vec<ToolCallRecord>,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ResetRequest {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct ResetResponse {
    message: String,
}

#[utoipa::path(
    post,
    path = "/chat",
    tag = "chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Conversation turn committed", body = ChatResponse),
        (status = 400, description = "Blank text", body = ErrorResponse),
        (status = 502, description = "Model failed or never produced a final reply", body = ErrorResponse),
        (status = 504, description = "Turn exceeded the request timeout", body = ErrorResponse)
    )
)]
async fn chat_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorResponse>)> {
    info!(
        session = payload.session_id.as_deref(),
        "Received /chat request"
    );

    if payload.text.trim().is_empty() {
        error!("Rejecting /chat request due to blank text");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                message: "text cannot be empty".to_string(),
            }),
        ));
    }

    let gateway = state.gateway();
    match gateway.converse(payload.session_id, payload.text).await {
        Ok(outcome) => {
            info!(
                session_id = outcome.session_id.as_str(),
                tool_calls = outcome.tool_calls.len(),
                "Chat turn completed"
            );
            Ok(Json(ChatResponse {
                message: outcome.message,
                session_id: outcome.session_id,
                tool_calls: outcome.tool_calls,
            }))
        }
        Err(failure) => {
            error!(error = %failure, "Chat turn failed");
            let status = match &failure {
                GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                GatewayError::Model(_) | GatewayError::ToolLoopExhausted { .. } => {
                    StatusCode::BAD_GATEWAY
                }
            };
            Err((
                status,
                Json(ErrorResponse {
                    message: failure.user_message(),
                }),
            ))
        }
    }
}

#[utoipa::path(
    post,
    path = "/reset",
    tag = "chat",
    request_body = ResetRequest,
    responses(
        (status = 200, description = "History cleared", body = ResetResponse)
    )
)]
async fn reset_handler(
    State(state): State<Arc<ServerState>>,
    payload: Option<Json<ResetRequest>>,
) -> Json<ResetResponse> {
    // A body-less POST clears every session.
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    state.gateway().reset(payload.session_id.as_deref()).await;
    Json(ResetResponse {
        message: "cleared".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/tools",
    tag = "tools",
    responses(
        (status = 200, description = "Tools offered to the model", body = Vec<ToolDeclaration>)
    )
)]
async fn tools_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<ToolDeclaration>> {
    let gateway = state.gateway();
    debug!(
        tool_count = gateway.declarations().len(),
        "Serving /tools request"
    );
    Json(gateway.declarations().to_vec())
}
