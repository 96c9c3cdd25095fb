//! Shared fixtures: signing keys, a mock identity provider and a mock
//! sandbox API, each served by a real axum server on an ephemeral port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use sandbox_mcp_gateway::config::Config;
use sandbox_mcp_gateway::gateway::Gateway;

pub const ISSUER: &str = "https://tenant.example.auth0.com/";
pub const AUDIENCE: &str = "https://sandbox-api.example.com";

/// Serve `app` on 127.0.0.1 with an OS-assigned port
pub async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ============================================================================
// Signing keys
// ============================================================================

/// P-256 signing key with its public JWK
pub struct TestKey {
    pub kid: String,
    encoding: EncodingKey,
    pub jwk: Value,
}

impl TestKey {
    pub fn generate(kid: &str) -> Self {
        let kp = rcgen::KeyPair::generate().unwrap();
        let encoding = EncodingKey::from_ec_pem(kp.serialize_pem().as_bytes()).unwrap();
        let raw = kp.public_key_raw();
        let jwk = json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": kid,
            "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&raw[33..65]),
        });
        Self {
            kid: kid.to_string(),
            encoding,
            jwk,
        }
    }

    /// Sign `claims` with this key's kid in the header
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding).unwrap()
    }

    /// Sign a valid token for `sub`
    pub fn token(&self, sub: &str) -> String {
        self.sign(&claims(sub, json!({})))
    }
}

/// Valid claims for `sub`, with `overrides` merged in (null removes a claim)
pub fn claims(sub: &str, overrides: Value) -> Value {
    let now = chrono::Utc::now().timestamp();
    let mut base = json!({
        "sub": sub,
        "iss": ISSUER,
        "aud": [AUDIENCE, "https://tenant.example.auth0.com/userinfo"],
        "iat": now,
        "exp": now + 3600,
        "scope": "openid read:sandboxes",
    });
    if let (Some(base), Some(extra)) = (base.as_object_mut(), overrides.as_object()) {
        for (k, v) in extra {
            if v.is_null() {
                base.remove(k);
            } else {
                base.insert(k.clone(), v.clone());
            }
        }
    }
    base
}

// ============================================================================
// Mock identity provider
// ============================================================================

#[derive(Default)]
struct IdpState {
    keys: Mutex<Vec<Value>>,
    failing: Mutex<bool>,
    delay: Mutex<Duration>,
    hits: AtomicUsize,
}

/// JWKS endpoint whose key list, latency and health tests control
#[derive(Clone)]
pub struct MockIdp {
    pub addr: SocketAddr,
    state: Arc<IdpState>,
}

impl MockIdp {
    pub async fn start(keys: &[&TestKey]) -> Self {
        let state = Arc::new(IdpState::default());
        *state.keys.lock() = keys.iter().map(|k| k.jwk.clone()).collect();
        let app = Router::new()
            .route("/.well-known/jwks.json", get(jwks))
            .with_state(Arc::clone(&state));
        let addr = spawn(app).await;
        Self { addr, state }
    }

    pub fn jwks_url(&self) -> String {
        format!("http://{}/.well-known/jwks.json", self.addr)
    }

    /// Replace the published keys
    pub fn publish(&self, keys: &[&TestKey]) {
        *self.state.keys.lock() = keys.iter().map(|k| k.jwk.clone()).collect();
    }

    /// Answer 503 until reset
    pub fn set_failing(&self, failing: bool) {
        *self.state.failing.lock() = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// JWKS requests served so far
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

async fn jwks(State(state): State<Arc<IdpState>>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let delay = *state.delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if *state.failing.lock() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let keys = state.keys.lock().clone();
    Json(json!({ "keys": keys })).into_response()
}

// ============================================================================
// Mock sandbox API
// ============================================================================

/// One request as the upstream saw it
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

#[derive(Clone)]
struct Canned {
    status: StatusCode,
    body: String,
    delay: Duration,
}

#[derive(Default)]
struct UpstreamState {
    requests: Mutex<Vec<Recorded>>,
    routes: Mutex<HashMap<String, Canned>>,
}

/// Records every request and answers from a per-path table (default `200 {}`)
#[derive(Clone)]
pub struct MockUpstream {
    pub addr: SocketAddr,
    state: Arc<UpstreamState>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(UpstreamState::default());
        let addr = spawn(Self::app(&state)).await;
        Self { addr, state }
    }

    /// Reserve a port that refuses connections until `delay` has passed
    pub async fn start_after(delay: Duration) -> Self {
        let state = Arc::new(UpstreamState::default());
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let app = Self::app(&state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    fn app(state: &Arc<UpstreamState>) -> Router {
        Router::new()
            .fallback(upstream)
            .with_state(Arc::clone(state))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer `path` with `status` and a JSON body
    pub fn respond(&self, path: &str, status: u16, body: &Value) {
        self.respond_raw(path, status, &body.to_string());
    }

    /// Answer `path` with `status` and a raw body
    pub fn respond_raw(&self, path: &str, status: u16, body: &str) {
        self.state.routes.lock().insert(
            path.to_string(),
            Canned {
                status: StatusCode::from_u16(status).unwrap(),
                body: body.to_string(),
                delay: Duration::ZERO,
            },
        );
    }

    /// Answer `path` only after `delay`
    pub fn respond_slowly(&self, path: &str, delay: Duration) {
        self.state.routes.lock().insert(
            path.to_string(),
            Canned {
                status: StatusCode::OK,
                body: "{}".to_string(),
                delay,
            },
        );
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().clone()
    }
}

async fn upstream(
    State(state): State<Arc<UpstreamState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.requests.lock().push(Recorded {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(String::from),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        body: serde_json::from_slice(&body).ok(),
    });

    let canned = state.routes.lock().get(uri.path()).cloned();
    let Some(canned) = canned else {
        return Json(json!({})).into_response();
    };
    if !canned.delay.is_zero() {
        tokio::time::sleep(canned.delay).await;
    }
    (
        canned.status,
        [("content-type", "application/json")],
        canned.body,
    )
        .into_response()
}

// ============================================================================
// Gateway under test
// ============================================================================

/// Config pointing at the mocks
pub fn config(idp: &MockIdp, upstream: &MockUpstream) -> Config {
    let mut config = Config::default();
    config.auth.domain = "tenant.example.auth0.com".to_string();
    config.auth.audience = AUDIENCE.to_string();
    config.auth.issuer = Some(ISSUER.to_string());
    config.auth.jwks_url = Some(idp.jwks_url());
    config.upstream.base_url = upstream.base_url();
    config
}

/// Start a gateway on an ephemeral port and return its base URL
pub async fn start_gateway(config: Config) -> String {
    let gateway = Gateway::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        gateway
            .serve(listener, std::future::pending())
            .await
            .unwrap();
    });
    // serve() loads keys before accepting; wait until it answers
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .is_ok()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    format!("http://{addr}")
}

/// JSON-RPC `tools/call` envelope
pub fn tools_call(id: i64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": name, "arguments": arguments}
    })
}
