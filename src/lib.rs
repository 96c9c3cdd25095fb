//! Sandbox MCP Gateway Library
//!
//! Exposes the sandbox provisioning REST API as Model Context Protocol tools.
//!
//! # Features
//!
//! - **Authentication**: OAuth2/JWT bearer tokens verified locally against the
//!   identity provider's published key set, with legacy API keys as fallback
//! - **Key caching**: single-flight JWKS refresh, stale keys survive provider outages
//! - **Credential forwarding**: the upstream sees the caller's own credential
//! - **Transports**: Streamable HTTP (`/mcp`) and legacy SSE (`/sse` + `/messages`)
//!
//! # Protocol Version
//!
//! Implements MCP protocol versions 2024-11-05 and 2025-03-26 (Streamable HTTP).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_current_span(false))
                .try_init()
                .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?;
        }
    }

    Ok(())
}
