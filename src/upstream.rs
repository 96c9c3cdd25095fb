//! Upstream client adapter - turns a tool call into one sandbox API request.
//!
//! # Request construction
//!
//! - Path placeholders are filled per segment through [`Url::path_segments_mut`],
//!   so argument values are percent-encoded and cannot add segments. Dot
//!   segments are refused outright.
//! - Query and body fields use the descriptor's upstream names; omitted
//!   optional arguments fall back to their declared default.
//! - The forwarded credential is the only `Authorization` the upstream sees.
//!
//! # Failure model
//!
//! Every failure becomes an [`UpstreamError`] whose `kind` the caller can
//! act on. Connection failures on idempotent tools get exactly one retry.

use std::time::{Duration, Instant};

use backon::{ConstantBuilder, Retryable};
use reqwest::{StatusCode, header};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::AuthenticatedCaller;
use crate::config::UpstreamConfig;
use crate::registry::{ParamLocation, ParamSpec, TimeoutClass, ToolDescriptor, is_dot_segment};
use crate::{Error, Result};

/// Maximum characters of upstream error text passed back to callers
const MAX_ERROR_DETAIL: usize = 500;

/// Pause before the single connection-level retry
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Why an upstream call did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// Network failure or timeout
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// The upstream refused the forwarded credential
    #[error("Upstream rejected the credential (HTTP {status}): {message}")]
    AuthRejected {
        /// 401 or 403
        status: u16,
        /// Upstream detail
        message: String,
    },

    /// The addressed resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other 4xx
    #[error("Bad request (HTTP {status}): {message}")]
    BadRequest {
        /// HTTP status
        status: u16,
        /// Upstream detail
        message: String,
    },

    /// 5xx or an unexpected status
    #[error("Upstream error (HTTP {status}): {message}")]
    ServerError {
        /// HTTP status
        status: u16,
        /// Upstream detail
        message: String,
    },

    /// Arguments failed local validation; nothing was sent
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

impl UpstreamError {
    /// Stable machine-readable kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "upstream_unavailable",
            Self::AuthRejected { .. } => "upstream_auth_rejected",
            Self::NotFound(_) => "not_found",
            Self::BadRequest { .. } => "bad_request",
            Self::ServerError { .. } => "upstream_error",
            Self::InvalidArguments(_) => "invalid_arguments",
        }
    }

    /// Upstream HTTP status, when there was a response
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthRejected { status, .. }
            | Self::BadRequest { status, .. }
            | Self::ServerError { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            Self::Unavailable(_) | Self::InvalidArguments(_) => None,
        }
    }

    /// Human-readable detail without the kind prefix
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Unavailable(m) | Self::NotFound(m) | Self::InvalidArguments(m) => m,
            Self::AuthRejected { message, .. }
            | Self::BadRequest { message, .. }
            | Self::ServerError { message, .. } => message,
        }
    }

    /// `{"error": {"kind", "status", "message"}}` payload for tool results
    #[must_use]
    pub fn to_payload(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind(),
                "status": self.status(),
                "message": self.message(),
            }
        })
    }

    /// Map a non-success response
    #[must_use]
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let message = error_detail(body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("no detail")
                .to_string()
        });
        let code = status.as_u16();
        match code {
            401 | 403 => Self::AuthRejected {
                status: code,
                message,
            },
            404 => Self::NotFound(message),
            400..=499 => Self::BadRequest {
                status: code,
                message,
            },
            _ => Self::ServerError {
                status: code,
                message,
            },
        }
    }

    fn from_transport(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Unavailable(format!("timed out after {}s", timeout.as_secs()))
        } else if err.is_connect() {
            Self::Unavailable(format!("connection failed: {err}"))
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Pull a readable message out of an upstream error body
///
/// Looks at the `error`, `Error`, `errorString` and `errors` fields of a JSON
/// body, falling back to the raw text. Truncated to 500 characters.
#[must_use]
pub fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["error", "Error", "errorString", "errors"]
            .iter()
            .find_map(|field| match v.get(field) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            })
    });

    let detail = from_json.unwrap_or_else(|| body.to_string());
    Some(detail.chars().take(MAX_ERROR_DETAIL).collect())
}

/// HTTP client for the sandbox API
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    query_timeout: Duration,
}

impl UpstreamClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be built.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("Invalid upstream base URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "Upstream base URL cannot carry a path: {base_url}"
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("sandbox-mcp-gateway/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url,
            timeout: config.timeout,
            query_timeout: config.query_timeout,
        })
    }

    /// Timeout applied to `tool`
    #[must_use]
    pub fn timeout_for(&self, tool: &ToolDescriptor) -> Duration {
        match tool.timeout_class {
            TimeoutClass::Standard => self.timeout,
            TimeoutClass::Query => self.query_timeout,
        }
    }

    /// Full request URL for `tool` called with `arguments`
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidArguments`] if a path argument is
    /// missing or is a dot segment.
    pub fn build_url(&self, tool: &ToolDescriptor, arguments: &Value) -> std::result::Result<Url, UpstreamError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| UpstreamError::InvalidArguments("base URL cannot carry a path".into()))?;
            segments.pop_if_empty();
            for segment in tool.path.trim_start_matches('/').split('/') {
                match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => {
                        let value = arguments
                            .get(name)
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                UpstreamError::InvalidArguments(format!(
                                    "missing required argument '{name}'"
                                ))
                            })?;
                        if is_dot_segment(value) {
                            return Err(UpstreamError::InvalidArguments(format!(
                                "argument '{name}' must not be '.' or '..'"
                            )));
                        }
                        segments.push(value);
                    }
                    None => {
                        segments.push(segment);
                    }
                }
            }
        }

        let pairs: Vec<(&str, String)> = tool
            .params
            .iter()
            .filter(|p| p.location == ParamLocation::Query)
            .filter_map(|p| resolve(p, arguments).map(|v| (p.upstream_name, query_value(&v))))
            .collect();
        if !pairs.is_empty() {
            let mut query = url.query_pairs_mut();
            for (name, value) in &pairs {
                query.append_pair(name, value);
            }
        }

        Ok(url)
    }

    /// JSON body for `tool`, or `None` when the operation takes no body
    #[must_use]
    pub fn build_body(tool: &ToolDescriptor, arguments: &Value) -> Option<Value> {
        if !tool.has_body() {
            return None;
        }
        let mut body: Map<String, Value> = tool.fixed_body.clone();
        for p in tool.params.iter().filter(|p| p.location == ParamLocation::Body) {
            if let Some(value) = resolve(p, arguments) {
                body.insert(p.upstream_name.to_string(), value);
            }
        }
        Some(Value::Object(body))
    }

    /// Execute one tool call against the upstream
    ///
    /// `caller` is `None` only for tools that do not require authentication;
    /// no `Authorization` header is sent then.
    ///
    /// # Errors
    ///
    /// Returns an [`UpstreamError`] describing why no result was produced.
    pub async fn execute(
        &self,
        tool: &ToolDescriptor,
        arguments: &Value,
        caller: Option<&AuthenticatedCaller>,
    ) -> std::result::Result<Value, UpstreamError> {
        tool.validate_arguments(arguments)
            .map_err(UpstreamError::InvalidArguments)?;

        let url = self.build_url(tool, arguments)?;
        let body = Self::build_body(tool, arguments);
        let timeout = self.timeout_for(tool);
        let authorization = caller.map(|c| c.forward.authorization_header());
        let started = Instant::now();

        debug!(tool = tool.name, method = %tool.method, path = url.path(), "Calling upstream");

        let http = &self.http;
        let target = &url;
        let body = body.as_ref();
        let authorization = authorization.as_deref();
        let send = move || async move {
            let mut request = http
                .request(tool.method.clone(), target.clone())
                .timeout(timeout)
                .header(header::ACCEPT, "application/json");
            if let Some(authorization) = authorization {
                request = request.header(header::AUTHORIZATION, authorization);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            request.send().await
        };

        let sent = if tool.idempotent {
            send.retry(
                ConstantBuilder::default()
                    .with_delay(RETRY_DELAY)
                    .with_max_times(1),
            )
            .when(reqwest::Error::is_connect)
            .notify(|err: &reqwest::Error, after: Duration| {
                warn!(tool = tool.name, error = %err, "Upstream connection failed, retrying in {after:?}");
            })
            .await
        } else {
            send().await
        };

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                let err = UpstreamError::from_transport(&e, timeout);
                warn!(
                    tool = tool.name,
                    elapsed_ms = elapsed_ms(started),
                    error = %err,
                    "Upstream call failed"
                );
                return Err(err);
            }
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UpstreamError::from_transport(&e, timeout))?;

        info!(
            tool = tool.name,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms(started),
            "Upstream call completed"
        );

        if !status.is_success() {
            return Err(UpstreamError::from_response(status, &text));
        }

        Ok(success_body(status, text))
    }
}

/// Argument value, or the declared default when omitted
fn resolve(spec: &ParamSpec, arguments: &Value) -> Option<Value> {
    match arguments.get(spec.name) {
        Some(v) if !v.is_null() => Some(v.clone()),
        _ => spec.default.clone(),
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 202/204 and empty bodies become `{}`; non-JSON text is returned as a string
fn success_body(status: StatusCode, text: String) -> Value {
    if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT || text.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
