//! Gateway server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::McpHandler;
use super::router::{AppState, create_router};
use super::session::SessionStore;
use crate::auth::{Authorizer, KeyMaterialCache};
use crate::config::Config;
use crate::registry::Registry;
use crate::upstream::UpstreamClient;
use crate::{Error, Result};

/// Sandbox MCP gateway server
pub struct Gateway {
    config: Config,
    keys: Arc<KeyMaterialCache>,
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build every component from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the tool table is inconsistent or a client cannot
    /// be constructed.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(Registry::builtin()?);
        let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
        let keys = Arc::new(
            KeyMaterialCache::from_config(&config.auth)
                .map_err(|e| Error::Config(format!("Key cache: {e}")))?,
        );
        let authorizer = Arc::new(Authorizer::from_config(&config, Arc::clone(&keys)));
        let handler = Arc::new(McpHandler::new(registry, authorizer, upstream));

        let shutdown = CancellationToken::new();
        let state = Arc::new(AppState {
            handler,
            sessions: Arc::new(SessionStore::new(shutdown.clone()).with_limits(
                config.server.session_idle_timeout,
                config.server.max_sessions,
            )),
            sse_keep_alive: config.server.sse_keep_alive,
        });

        Ok(Self {
            config,
            keys,
            state,
            shutdown,
        })
    }

    /// The HTTP application
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), &self.config.server)
    }

    /// Bind the configured address and serve until SIGINT/SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` completes
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve(
        self,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        if self.config.auth.jwt_enabled {
            match self.keys.refresh().await {
                Ok(set) => info!(keys = set.len(), "Signing keys loaded"),
                Err(e) => warn!(
                    error = %e,
                    "Initial JWKS fetch failed; tokens are rejected until a refresh succeeds"
                ),
            }
            Arc::clone(&self.keys).spawn_refresh_loop(
                self.config.auth.jwks_refresh_interval,
                self.shutdown.clone(),
            );
        }

        Arc::clone(&self.state.sessions).spawn_sweeper();

        let app = self.router();
        self.banner(&listener);

        let shutdown = self.shutdown.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
            .with_graceful_shutdown(async move {
                signal.await;
                // Ends SSE streams and in-flight calls so the drain can finish
                shutdown.cancel();
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.shutdown.cancel();
        info!("Gateway stopped");
        Ok(())
    }

    fn banner(&self, listener: &TcpListener) {
        let addr = listener
            .local_addr()
            .map_or_else(|_| "?".to_string(), |a| a.to_string());
        let auth = &self.config.auth;

        info!("============================================================");
        info!("SANDBOX MCP GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(address = %addr, "Listening");
        info!(tools = self.state.handler.registry().len(), upstream = %self.config.upstream.base_url, "Tools registered");
        if auth.jwt_enabled {
            info!(issuer = %auth.issuer(), audience = %auth.audience, "JWT authentication enabled");
        }
        if auth.legacy_api_keys {
            let mode = if auth.api_key.is_some() { "local" } else { "delegated" };
            info!(mode, "Legacy API keys accepted");
        }
        info!("  POST http://{addr}/mcp       (Streamable HTTP)");
        info!("  GET  http://{addr}/sse       (legacy SSE)");
        info!("============================================================");
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
