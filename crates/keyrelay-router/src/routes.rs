//! The HTTP surface, §6: one route per supported dialect plus the
//! synthesized models listing and a liveness probe.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use keyrelay_core::CoreState;
use keyrelay_transform::Dialect;
use tokio_util::sync::CancellationToken;

use crate::ConnDisconnect;
use crate::handler::dispatch;
use crate::models::ModelListCache;

/// Pulls the connection's disconnect signal out of the request
/// extensions. Missing only when the app is served without going through
/// the accept loop that inserts it (e.g. a router built directly in a
/// test); in that case a token that nothing ever cancels is a harmless
/// fallback.
fn conn_cancel(extension: Option<Extension<ConnDisconnect>>) -> CancellationToken {
    extension.map(|Extension(ConnDisconnect(token))| token).unwrap_or_else(CancellationToken::new)
}

/// Everything the route closures need beyond the pipeline state itself.
pub struct AppState {
    pub core: Arc<CoreState>,
    pub models: ModelListCache,
}

pub fn router(core: Arc<CoreState>) -> Router {
    let state = Arc::new(AppState { core, models: ModelListCache::new() });
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/complete", post(complete))
        .route("/v1/messages", post(messages))
        .route("/v1/claude-3/complete", post(claude_3_complete))
        .route("/v1/models", get(models))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    conn: Option<Extension<ConnDisconnect>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state.core.clone(), Dialect::OpenAiChat, None, headers, body, conn_cancel(conn)).await
}

async fn complete(
    State(state): State<Arc<AppState>>,
    conn: Option<Extension<ConnDisconnect>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state.core.clone(), Dialect::AnthropicText, None, headers, body, conn_cancel(conn)).await
}

async fn messages(
    State(state): State<Arc<AppState>>,
    conn: Option<Extension<ConnDisconnect>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state.core.clone(), Dialect::AnthropicChat, None, headers, body, conn_cancel(conn)).await
}

/// Legacy Claude-3 compatibility shim: always answers through the older
/// `/v1/complete` dialect, but forces the model so callers that haven't
/// been updated still reach a current model.
async fn claude_3_complete(
    State(state): State<Arc<AppState>>,
    conn: Option<Extension<ConnDisconnect>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(
        state.core.clone(),
        Dialect::AnthropicText,
        Some("claude-3-sonnet-20240229".to_string()),
        headers,
        body,
        conn_cancel(conn),
    )
    .await
}

async fn models(State(state): State<Arc<AppState>>) -> Response {
    let body = state.models.get(&state.core.pool).await;
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| Response::new(axum::body::Body::empty()))
}

async fn healthz() -> &'static str {
    "ok"
}
