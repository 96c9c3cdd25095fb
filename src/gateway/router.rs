//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Query, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{Span, debug, info, info_span, warn};

use super::auth::{
    CallMetadata, SESSION_HEADER, capture_call_metadata, client_ip, unauthorized_response,
};
use super::handler::{CallContext, McpHandler};
use super::session::{SessionKind, SessionStore, sse_response};
use crate::config::ServerConfig;
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcResponse, RequestId};

/// Shared application state
pub struct AppState {
    /// MCP dispatcher
    pub handler: Arc<McpHandler>,
    /// Live client sessions
    pub sessions: Arc<SessionStore>,
    /// Keep-alive interval for SSE streams
    pub sse_keep_alive: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/mcp",
            post(mcp_post_handler)
                .get(mcp_get_handler)
                .delete(mcp_delete_handler),
        )
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .layer(middleware::from_fn(capture_call_metadata))
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(middleware::from_fn(security_headers))
        .layer(CorsLayer::permissive())
        .layer(ConcurrencyLimitLayer::new(server.max_concurrent_requests.max(1)))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Access-log span; the client address honours a fronting proxy's headers
fn request_span(request: &Request<Body>) -> Span {
    let client = client_ip(request).map_or_else(|| "-".to_string(), |ip| ip.to_string());
    info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        client_ip = %client,
    )
}

/// Add `X-Frame-Options` and `X-Content-Type-Options` to every response
async fn security_headers(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /mcp - Streamable HTTP requests
async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<CallMetadata>,
    body: Bytes,
) -> Response {
    let message = match parse_body(&body) {
        Ok(v) => v,
        Err(response) => return response,
    };

    let is_initialize = message.get("method").and_then(Value::as_str) == Some("initialize");

    let session = match meta.session_id.as_deref() {
        Some(id) => match state.sessions.get(id) {
            Some(session) if session.kind == SessionKind::Streamable => Some(session),
            _ if is_initialize => None,
            _ => {
                debug!(session_id = %id, "Unknown session");
                return rpc_status(
                    StatusCode::NOT_FOUND,
                    JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Session not found"),
                );
            }
        },
        None => None,
    };

    let ctx = match &session {
        Some(s) => CallContext {
            authorization: meta.authorization.clone(),
            scope: Some(s.id.clone()),
            cancel: s.cancel.clone(),
        },
        None => CallContext::sessionless(meta.authorization.clone()),
    };

    let Some(response) = state.handler.handle(message, &ctx).await else {
        return StatusCode::ACCEPTED.into_response();
    };

    let session_id = match (&session, is_initialize && response.error.is_none()) {
        (Some(s), _) => Some(s.id.clone()),
        (None, true) => match state.sessions.create_streamable() {
            Some(created) => Some(created.id.clone()),
            None => return session_limit(response.id),
        },
        (None, false) => None,
    };

    let mut http = match response.error_code() {
        Some(rpc_codes::UNAUTHENTICATED) => unauthorized_response(response),
        Some(rpc_codes::PARSE_ERROR | rpc_codes::INVALID_REQUEST) => {
            rpc_status(StatusCode::BAD_REQUEST, response)
        }
        _ => Json(response).into_response(),
    };

    if let Some(id) = session_id
        && let Ok(value) = HeaderValue::from_str(&id)
    {
        http.headers_mut().insert(SESSION_HEADER, value);
    }
    http
}

fn session_limit(id: Option<RequestId>) -> Response {
    rpc_status(
        StatusCode::SERVICE_UNAVAILABLE,
        JsonRpcResponse::error(id, rpc_codes::INTERNAL_ERROR, "Session limit reached"),
    )
}

/// GET /mcp - no server-initiated stream on this endpoint
async fn mcp_get_handler() -> Response {
    let mut response = rpc_status(
        StatusCode::METHOD_NOT_ALLOWED,
        JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Method not allowed. Use POST to send JSON-RPC requests to /mcp",
        ),
    );
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("POST, DELETE"));
    response
}

/// DELETE /mcp - session termination
async fn mcp_delete_handler(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<CallMetadata>,
) -> StatusCode {
    match meta.session_id.as_deref() {
        Some(id) if state.sessions.remove(id) => {
            info!(session_id = %id, "Session terminated by client");
            StatusCode::NO_CONTENT
        }
        Some(id) => {
            debug!(session_id = %id, "Session not found for DELETE");
            StatusCode::NOT_FOUND
        }
        None => StatusCode::BAD_REQUEST,
    }
}

/// GET /sse - legacy event stream
async fn sse_handler(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<CallMetadata>,
) -> Response {
    let Some((session, rx)) = state.sessions.create_sse(meta.authorization) else {
        return session_limit(None);
    };
    info!(session_id = %session.id, "Client connected to SSE stream");
    sse_response(
        Arc::clone(&state.sessions),
        session,
        rx,
        state.sse_keep_alive,
    )
    .into_response()
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    session_id: Option<String>,
}

/// POST /messages - legacy SSE requests; responses go out on the stream
async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<CallMetadata>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "session_id query parameter is required"})),
        )
            .into_response();
    };
    let Some(session) = state
        .sessions
        .get(&session_id)
        .filter(|s| s.kind == SessionKind::LegacySse)
    else {
        debug!(session_id = %session_id, "Unknown SSE session");
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Session not found"})))
            .into_response();
    };

    let message = match parse_body(&body) {
        Ok(v) => v,
        Err(response) => return response,
    };

    let ctx = CallContext {
        authorization: meta.authorization.or_else(|| session.authorization.clone()),
        scope: Some(session.id.clone()),
        cancel: session.cancel.clone(),
    };

    let handler = Arc::clone(&state.handler);
    tokio::spawn(async move {
        if let Some(response) = handler.handle(message, &ctx).await
            && !session.deliver(response).await
        {
            warn!(session_id = %session.id, "SSE stream closed before response was delivered");
        }
    });

    StatusCode::ACCEPTED.into_response()
}

#[allow(clippy::result_large_err)]
fn parse_body(body: &[u8]) -> Result<Value, Response> {
    serde_json::from_slice(body).map_err(|e| {
        rpc_status(
            StatusCode::BAD_REQUEST,
            JsonRpcResponse::error(None, rpc_codes::PARSE_ERROR, format!("Invalid JSON: {e}")),
        )
    })
}

fn rpc_status(status: StatusCode, body: JsonRpcResponse) -> Response {
    (status, Json(body)).into_response()
}
