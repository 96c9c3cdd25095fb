//! MCP method dispatch
//!
//! Transport-agnostic: the router hands over one decoded JSON-RPC message and
//! the call's metadata, and gets back the response to send, if any.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::InflightRegistry;
use crate::auth::{AuthError, AuthenticatedCaller, Authorizer};
use crate::error::rpc_codes;
use crate::protocol::{
    CancelledParams, Content, Info, InitializeParams, InitializeResult, JsonRpcResponse,
    RequestId, ServerCapabilities, ToolsCallParams, ToolsCallResult, ToolsCapability,
    ToolsListResult, negotiate_version,
};
use crate::registry::Registry;
use crate::upstream::{UpstreamClient, UpstreamError};

/// Server name reported by `initialize`
pub const SERVER_NAME: &str = "sandbox-mcp-gateway";

const INSTRUCTIONS: &str = "Tools for managing sandbox database instances: start, list, extend \
and terminate sandboxes, manage backups and Aura uploads, and run Cypher queries. \
Every tool call needs an Authorization header carrying a bearer token or an API key.";

/// What the transport knows about one inbound message
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
    /// Session the message belongs to. Sessionless calls are not
    /// addressable by `notifications/cancelled`.
    pub scope: Option<String>,
    /// Parent for the call's cancellation token
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Context for a message outside any session
    #[must_use]
    pub fn sessionless(authorization: Option<String>) -> Self {
        Self {
            authorization,
            scope: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Handles decoded JSON-RPC messages
pub struct McpHandler {
    registry: Arc<Registry>,
    authorizer: Arc<Authorizer>,
    upstream: Arc<UpstreamClient>,
    inflight: Arc<InflightRegistry>,
}

impl McpHandler {
    /// Create a handler
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        authorizer: Arc<Authorizer>,
        upstream: Arc<UpstreamClient>,
    ) -> Self {
        Self {
            registry,
            authorizer,
            upstream,
            inflight: Arc::new(InflightRegistry::new()),
        }
    }

    /// Tool registry
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Calls currently running
    #[must_use]
    pub fn inflight(&self) -> &Arc<InflightRegistry> {
        &self.inflight
    }

    /// Handle one message; `None` means nothing is sent back
    pub async fn handle(&self, message: Value, ctx: &CallContext) -> Option<JsonRpcResponse> {
        let (id, method, params) = match parse_request(&message) {
            Ok(parsed) => parsed,
            Err(response) => return Some(response),
        };

        if is_notification_method(&method) {
            self.handle_notification(&method, params.as_ref(), ctx);
            return None;
        }

        // parse_request guarantees an id for non-notifications
        let id = id?;
        debug!(method = %method, id = %id, "MCP request");

        let response = match method.as_str() {
            "initialize" => Self::handle_initialize(id, params.as_ref()),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, params, ctx).await,
            _ => JsonRpcResponse::error(
                Some(id),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ),
        };
        Some(response)
    }

    fn handle_notification(&self, method: &str, params: Option<&Value>, ctx: &CallContext) {
        if method != "notifications/cancelled" {
            debug!(notification = %method, "Notification acknowledged");
            return;
        }
        let Some(params) = params.and_then(|p| serde_json::from_value::<CancelledParams>(p.clone()).ok())
        else {
            debug!("Ignoring malformed cancellation");
            return;
        };
        let Some(scope) = ctx.scope.as_deref() else {
            debug!(request_id = %params.request_id, "Ignoring cancellation outside a session");
            return;
        };
        let found = self.inflight.cancel(scope, &params.request_id);
        info!(
            request_id = %params.request_id,
            reason = params.reason.as_deref().unwrap_or("-"),
            found,
            "Cancellation requested"
        );
    }

    /// `initialize`
    pub fn handle_initialize(id: RequestId, params: Option<&Value>) -> JsonRpcResponse {
        let requested = params
            .and_then(|p| serde_json::from_value::<InitializeParams>(p.clone()).ok())
            .and_then(|p| p.protocol_version);
        let version = negotiate_version(requested.as_deref());
        debug!(requested = requested.as_deref().unwrap_or("-"), negotiated = version, "Initialize");

        let result = InitializeResult {
            protocol_version: version.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: Info {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Sandbox MCP".to_string()),
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        };
        to_response(id, &result)
    }

    /// `tools/list`
    pub fn handle_tools_list(&self, id: RequestId) -> JsonRpcResponse {
        let result = ToolsListResult {
            tools: self.registry.list_tools(),
            next_cursor: None,
        };
        to_response(id, &result)
    }

    /// `tools/call`
    pub async fn handle_tools_call(
        &self,
        id: RequestId,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> JsonRpcResponse {
        let params: ToolsCallParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::INVALID_PARAMS,
                    format!("Invalid tools/call params: {e}"),
                );
            }
            None => {
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::INVALID_PARAMS,
                    "Missing tools/call params",
                );
            }
        };

        let Some(tool) = self.registry.get(&params.name) else {
            return JsonRpcResponse::error(
                Some(id),
                rpc_codes::INVALID_PARAMS,
                format!("Unknown tool: {}", params.name),
            );
        };

        let caller = match self.authorize(tool.requires_auth, ctx).await {
            Ok(caller) => caller,
            // The specific reason is logged by the authorizer only
            Err(_) => return unauthenticated(Some(id)),
        };

        let guard = ctx
            .scope
            .as_deref()
            .map(|scope| self.inflight.register(scope, &id, &ctx.cancel));
        let token = guard
            .as_ref()
            .map_or_else(|| ctx.cancel.child_token(), |g| g.token().clone());
        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => {
                info!(tool = tool.name, id = %id, "Tool call cancelled");
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::REQUEST_CANCELLED,
                    "Request cancelled",
                );
            }
            outcome = self.upstream.execute(tool, &params.arguments, caller.as_ref()) => outcome,
        };
        drop(guard);

        let result = match outcome {
            Ok(value) => success_result(value),
            Err(e) => {
                warn!(tool = tool.name, kind = e.kind(), status = ?e.status(), "Tool call failed");
                error_result(&e)
            }
        };
        to_response(id, &result)
    }

    async fn authorize(
        &self,
        required: bool,
        ctx: &CallContext,
    ) -> Result<Option<AuthenticatedCaller>, AuthError> {
        let header = ctx.authorization.as_deref();
        if !required && header.is_none() {
            return Ok(None);
        }
        match self.authorizer.authorize(header).await {
            Ok(caller) => Ok(Some(caller)),
            Err(_) if !required => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Uniform local authentication failure
#[must_use]
pub fn unauthenticated(id: Option<RequestId>) -> JsonRpcResponse {
    JsonRpcResponse::error(id, rpc_codes::UNAUTHENTICATED, "Unauthenticated")
}

/// Upstream body as a tool result
fn success_result(value: Value) -> ToolsCallResult {
    let text = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let structured_content = value.is_object().then_some(value);
    ToolsCallResult {
        content: vec![Content::text(text)],
        structured_content,
        is_error: false,
    }
}

fn error_result(error: &UpstreamError) -> ToolsCallResult {
    ToolsCallResult {
        content: vec![Content::text(error.to_string())],
        structured_content: Some(error.to_payload()),
        is_error: true,
    }
}

fn to_response<T: serde::Serialize>(id: RequestId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(
            Some(id),
            rpc_codes::INTERNAL_ERROR,
            format!("Failed to serialize result: {e}"),
        ),
    }
}

/// Extract a `RequestId` from a JSON value.
///
/// Supports string and integer ID values per JSON-RPC 2.0.
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Parse JSON-RPC request or notification
/// Returns (Option<RequestId>, method, params) - id is None for notifications
#[allow(clippy::result_large_err)]
fn parse_request(
    value: &Value,
) -> Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    if value.is_array() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Batch requests are not supported",
        ));
    }

    let jsonrpc = value.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method"))?;

    let params = value.get("params").cloned();

    if !is_notification_method(method) && id.is_none() {
        return Err(JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Missing id"));
    }

    Ok((id, method.to_string(), params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialVerifier, JwksFetcher, KeyFetchError, KeyMaterialCache, KeySet};
    use crate::config::UpstreamConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct NoKeys;

    #[async_trait::async_trait]
    impl JwksFetcher for NoKeys {
        async fn fetch(&self) -> Result<KeySet, KeyFetchError> {
            Err(KeyFetchError::Status(503))
        }
    }

    fn handler() -> McpHandler {
        // Port 9 (discard) is never listening in test environments
        handler_at("http://127.0.0.1:9")
    }

    fn handler_at(base_url: &str) -> McpHandler {
        let keys = Arc::new(KeyMaterialCache::new(Arc::new(NoKeys), Duration::from_secs(10)));
        let authorizer = Authorizer::new(
            CredentialVerifier::new("https://idp.example.com/", "https://api.example.com"),
            keys,
        )
        .with_jwt(false);
        let upstream = UpstreamClient::new(&UpstreamConfig {
            base_url: base_url.into(),
            ..UpstreamConfig::default()
        })
        .unwrap();
        McpHandler::new(
            Arc::new(Registry::builtin().unwrap()),
            Arc::new(authorizer),
            Arc::new(upstream),
        )
    }

    fn ctx(auth: Option<&str>) -> CallContext {
        CallContext::sessionless(auth.map(String::from))
    }

    async fn call(h: &McpHandler, message: Value, auth: Option<&str>) -> JsonRpcResponse {
        h.handle(message, &ctx(auth)).await.unwrap()
    }

    #[tokio::test]
    async fn initialize_negotiates_version() {
        let h = handler();
        let resp = call(
            &h,
            json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{}}}),
            None,
        )
        .await;
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);

        let resp = call(
            &h,
            json!({"jsonrpc":"2.0","id":2,"method":"initialize","params":{"protocolVersion":"1999-01-01"}}),
            None,
        )
        .await;
        assert_eq!(resp.result.unwrap()["protocolVersion"], "2025-03-26");
    }

    #[tokio::test]
    async fn ping_and_tools_list_need_no_credential() {
        let h = handler();
        let resp = call(&h, json!({"jsonrpc":"2.0","id":"p","method":"ping"}), None).await;
        assert_eq!(resp.result, Some(json!({})));

        let resp = call(&h, json!({"jsonrpc":"2.0","id":3,"method":"tools/list"}), None).await;
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, h.registry().len());
    }

    #[tokio::test]
    async fn unknown_method_and_tool() {
        let h = handler();
        let resp = call(&h, json!({"jsonrpc":"2.0","id":1,"method":"resources/list"}), None).await;
        assert_eq!(resp.error_code(), Some(rpc_codes::METHOD_NOT_FOUND));

        let resp = call(
            &h,
            json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"nope"}}),
            Some("Bearer ApiKey k"),
        )
        .await;
        assert_eq!(resp.error_code(), Some(rpc_codes::INVALID_PARAMS));

        let resp = call(&h, json!({"jsonrpc":"2.0","id":1,"method":"tools/call"}), None).await;
        assert_eq!(resp.error_code(), Some(rpc_codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn missing_credential_is_unauthenticated() {
        let h = handler();
        let resp = call(
            &h,
            json!({"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"list_sandboxes_for_user"}}),
            None,
        )
        .await;
        assert_eq!(resp.error_code(), Some(rpc_codes::UNAUTHENTICATED));
        assert_eq!(resp.id, Some(RequestId::Number(9)));
        assert_eq!(resp.error.unwrap().message, "Unauthenticated");
    }

    #[tokio::test]
    async fn invalid_arguments_are_a_tool_error() {
        let h = handler();
        let resp = call(
            &h,
            json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"terminate_sandbox","arguments":{}}}),
            Some("Bearer ApiKey k"),
        )
        .await;
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["error"]["kind"], "invalid_arguments");
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let h = handler();
        assert!(
            h.handle(json!({"jsonrpc":"2.0","method":"notifications/initialized"}), &ctx(None))
                .await
                .is_none()
        );
        assert!(
            h.handle(
                json!({"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":5}}),
                &ctx(None)
            )
            .await
            .is_none()
        );
    }

    #[tokio::test]
    async fn cancelled_session_cancels_call() {
        let h = handler();
        let context = ctx(Some("Bearer ApiKey k"));
        context.cancel.cancel();
        let resp = h
            .handle(
                json!({"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"get_user_info"}}),
                &context,
            )
            .await
            .unwrap();
        assert_eq!(resp.error_code(), Some(rpc_codes::REQUEST_CANCELLED));
        assert!(h.inflight().is_empty());
    }

    /// Upstream that accepts connections and never answers
    async fn silent_upstream() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}")
    }

    fn user_info_call(id: i64) -> Value {
        json!({"jsonrpc":"2.0","id":id,"method":"tools/call","params":{"name":"get_user_info"}})
    }

    fn cancel_note(id: i64) -> Value {
        json!({"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":id}})
    }

    fn in_session(id: &str, cancel: &CancellationToken) -> CallContext {
        CallContext {
            authorization: Some("Bearer ApiKey k".into()),
            scope: Some(id.to_string()),
            cancel: cancel.clone(),
        }
    }

    #[tokio::test]
    async fn sessionless_cancellation_cannot_reach_other_callers() {
        // GIVEN: caller A waiting on the upstream outside any session
        let h = Arc::new(handler_at(&silent_upstream().await));
        let call = {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                h.handle(user_info_call(1), &ctx(Some("Bearer ApiKey alice"))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // WHEN: an unrelated sessionless client cancels the same id
        assert!(h.handle(cancel_note(1), &ctx(None)).await.is_none());

        // THEN: A keeps running and was never addressable
        assert!(h.inflight().is_empty());
        let still_running = tokio::time::timeout(Duration::from_millis(200), call).await;
        assert!(still_running.is_err());
    }

    #[tokio::test]
    async fn cancellation_is_scoped_to_the_session() {
        // GIVEN: a call in session s1
        let h = Arc::new(handler_at(&silent_upstream().await));
        let parent = CancellationToken::new();
        let mut call = {
            let h = Arc::clone(&h);
            let context = in_session("s1", &parent);
            tokio::spawn(async move { h.handle(user_info_call(7), &context).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.inflight().len(), 1);

        // WHEN: another session names the same request id
        let other = CancellationToken::new();
        h.handle(cancel_note(7), &in_session("s2", &other)).await;

        // THEN: untouched
        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut call)
                .await
                .is_err()
        );

        // WHEN: the owning session cancels it
        h.handle(cancel_note(7), &in_session("s1", &parent)).await;

        // THEN
        let resp = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(resp.error_code(), Some(rpc_codes::REQUEST_CANCELLED));
        assert!(h.inflight().is_empty());
    }

    #[test]
    fn envelope_errors() {
        let err = parse_request(&json!({"id": 1, "method": "ping"})).unwrap_err();
        assert_eq!(err.error_code(), Some(rpc_codes::INVALID_REQUEST));

        let err = parse_request(&json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(1)));

        let err = parse_request(&json!({"jsonrpc": "2.0", "method": "tools/list"})).unwrap_err();
        assert!(err.error.unwrap().message.contains("id"));

        let err = parse_request(&json!([{"jsonrpc": "2.0", "id": 1, "method": "ping"}])).unwrap_err();
        assert_eq!(err.error_code(), Some(rpc_codes::INVALID_REQUEST));
    }

    #[test]
    fn request_ids() {
        assert_eq!(extract_request_id(&json!("abc")), Some(RequestId::String("abc".into())));
        assert_eq!(extract_request_id(&json!(-1)), Some(RequestId::Number(-1)));
        assert_eq!(extract_request_id(&json!(1.5)), None);
        assert_eq!(extract_request_id(&Value::Null), None);
    }

    #[test]
    fn success_result_shapes() {
        let r = success_result(json!({"sandboxes": []}));
        assert_eq!(r.structured_content, Some(json!({"sandboxes": []})));
        assert_eq!(r.content, vec![Content::text(r#"{"sandboxes":[]}"#)]);

        let r = success_result(json!([1]));
        assert!(r.structured_content.is_none());

        let r = success_result(json!("plain"));
        assert_eq!(r.content, vec![Content::text("plain")]);
    }
}
