//! Upstream retry policy
//!
//! Idempotent reads get one more attempt when the connection itself fails.
//! Writes and HTTP-level failures are never retried.

mod common;

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use common::MockUpstream;
use sandbox_mcp_gateway::auth::{
    AuthMethod, AuthenticatedCaller, ForwardedCredential, IdentityContext,
};
use sandbox_mcp_gateway::config::UpstreamConfig;
use sandbox_mcp_gateway::registry::Registry;
use sandbox_mcp_gateway::upstream::{UpstreamClient, UpstreamError};

fn client(upstream: &MockUpstream) -> UpstreamClient {
    UpstreamClient::new(&UpstreamConfig {
        base_url: upstream.base_url(),
        ..UpstreamConfig::default()
    })
    .unwrap()
}

fn caller() -> AuthenticatedCaller {
    AuthenticatedCaller {
        identity: IdentityContext::api_key("k", AuthMethod::DelegatedApiKey),
        forward: ForwardedCredential::ApiKey("k".into()),
    }
}

async fn call(
    upstream: &MockUpstream,
    tool: &str,
    arguments: Value,
) -> Result<Value, UpstreamError> {
    let registry = Registry::builtin().unwrap();
    client(upstream)
        .execute(registry.get(tool).unwrap(), &arguments, Some(&caller()))
        .await
}

#[tokio::test]
async fn read_succeeds_on_second_attempt_after_refused_connection() {
    // GIVEN: an upstream that starts listening after the first attempt
    let upstream = MockUpstream::start_after(Duration::from_millis(80)).await;
    upstream.respond(
        "/SandboxGetRunningInstancesForUser",
        200,
        &json!({"sandboxes": ["abc123"]}),
    );

    // WHEN
    let result = call(&upstream, "list_sandboxes_for_user", json!({})).await;

    // THEN: the retry reached it exactly once
    assert_eq!(result.unwrap(), json!({"sandboxes": ["abc123"]}));
    assert_eq!(upstream.requests().len(), 1);
}

#[tokio::test]
async fn read_gives_up_after_one_retry() {
    // GIVEN: nothing ever listens
    let upstream = MockUpstream::start_after(Duration::from_secs(60)).await;

    // WHEN
    let started = Instant::now();
    let err = call(&upstream, "get_user_info", json!({})).await.unwrap_err();

    // THEN: unavailable, after waiting out the retry delay once
    assert_eq!(err.kind(), "upstream_unavailable");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn terminate_is_not_retried_after_refused_connection() {
    // GIVEN: the same late upstream
    let upstream = MockUpstream::start_after(Duration::from_millis(80)).await;

    // WHEN
    let err = call(&upstream, "terminate_sandbox", json!({"sandbox_hash_key": "abc123"}))
        .await
        .unwrap_err();

    // THEN: no second attempt once the upstream is up
    assert_eq!(err.kind(), "upstream_unavailable");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(upstream.requests().is_empty());
}

#[tokio::test]
async fn writes_are_never_retried() {
    for (tool, args) in [
        ("start_new_sandbox", json!({"usecase": "movies"})),
        ("write_query", json!({"hash_key": "abc123", "query": "CREATE (n)"})),
    ] {
        // GIVEN
        let upstream = MockUpstream::start_after(Duration::from_millis(80)).await;

        // WHEN
        let err = call(&upstream, tool, args).await.unwrap_err();

        // THEN
        assert_eq!(err.kind(), "upstream_unavailable", "{tool}");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(upstream.requests().is_empty(), "{tool}");
    }
}

#[tokio::test]
async fn server_errors_are_not_retried() {
    // GIVEN: a reachable upstream answering 503 and 502
    let upstream = MockUpstream::start().await;
    upstream.respond(
        "/SandboxGetRunningInstancesForUser",
        503,
        &json!({"error": "maintenance"}),
    );
    upstream.respond("/SandboxStopInstance", 502, &json!({"error": "bad gateway"}));

    // WHEN
    let read = call(&upstream, "list_sandboxes_for_user", json!({}))
        .await
        .unwrap_err();
    let write = call(&upstream, "terminate_sandbox", json!({"sandbox_hash_key": "abc123"}))
        .await
        .unwrap_err();

    // THEN: each reached the upstream exactly once
    assert_eq!(read.kind(), "upstream_error");
    assert_eq!(read.status(), Some(503));
    assert_eq!(write.kind(), "upstream_error");
    let paths: Vec<String> = upstream.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(
        paths,
        vec![
            "/SandboxGetRunningInstancesForUser".to_string(),
            "/SandboxStopInstance".to_string(),
        ]
    );
}
