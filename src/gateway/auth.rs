//! Call metadata capture and HTTP-level auth responses
//!
//! Credentials are verified per tool call by [`crate::auth::Authorizer`], not
//! per HTTP request: `initialize`, `ping` and `tools/list` are open. This
//! middleware only lifts what the dispatcher needs out of the request headers.

use std::net::{IpAddr, SocketAddr};

use axum::{
    Json,
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::protocol::JsonRpcResponse;

/// Header carrying the Streamable HTTP session id
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Per-request metadata the MCP dispatcher works from
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
    /// `Mcp-Session-Id` header value
    pub session_id: Option<String>,
}

impl CallMetadata {
    /// Read metadata from request headers
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        Self {
            authorization: text(header::AUTHORIZATION.as_str()),
            session_id: text(SESSION_HEADER),
        }
    }
}

/// Client address, preferring the first `X-Forwarded-For` hop and then
/// `X-Real-IP` set by a fronting proxy, else the socket peer
pub fn client_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    let headers = request.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
}

/// Attach [`CallMetadata`] to every request
pub async fn capture_call_metadata(mut request: Request<Body>, next: Next) -> Response {
    let metadata = CallMetadata::from_headers(request.headers());
    request.extensions_mut().insert(metadata);
    next.run(request).await
}

/// 401 carrying the JSON-RPC `Unauthenticated` error
pub fn unauthorized_response(body: JsonRpcResponse) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(body),
    )
        .into_response()
}
