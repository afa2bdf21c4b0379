use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use wireboard_core::config::ServerConfig;
use wireboard_core::error::Result;
use wireboard_kits::NodeHandlers;
use wireboard_runtime::{SecretTunnel, StaticSecrets};

use crate::routes;
use crate::sessions::SessionKeepers;
use crate::state::AppState;

/// HTTP proxy server built on axum.
///
/// Executes the node types listed in `server.proxy_nodes` on behalf of a
/// remote harness, revealing secrets from `server.secrets` just before use.
pub struct ProxyServer {
    state: Arc<AppState>,
}

impl ProxyServer {
    /// Fails when a `server.tunnels` pattern is not a valid regex.
    pub fn new(config: ServerConfig, handlers: NodeHandlers) -> Result<Self> {
        let ttl = Duration::from_secs(config.session_ttl_secs.max(1));
        let secrets = Arc::new(StaticSecrets::new(config.secrets.clone()));
        let tunnels = SecretTunnel::compile_all(&config.tunnels)?;
        Ok(Self {
            state: Arc::new(AppState {
                config,
                handlers: Arc::new(handlers),
                sessions: SessionKeepers::new(ttl),
                secrets,
                tunnels,
            }),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(routes::health))
            .route("/proxy", post(routes::proxy))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub fn sessions(&self) -> &SessionKeepers {
        &self.state.sessions
    }

    /// Run the server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();
        let bind = self.state.config.bind.clone();

        let sweeper = tokio::spawn(sweep_sessions(self.state.clone(), shutdown.clone()));

        let listener = TcpListener::bind(&bind).await?;
        info!(
            bind = %bind,
            proxy_nodes = ?self.state.config.proxy_nodes,
            "Proxy server listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        sweeper.abort();
        info!("Proxy server shut down");
        Ok(())
    }
}

async fn sweep_sessions(state: Arc<AppState>, shutdown: CancellationToken) {
    let period = state.sessions.ttl().min(Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = state.sessions.evict_idle();
                if evicted > 0 {
                    debug!(evicted, remaining = state.sessions.len(), "Swept proxy sessions");
                }
            }
        }
    }
}
