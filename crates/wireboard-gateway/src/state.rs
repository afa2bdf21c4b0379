use std::collections::HashMap;
use std::sync::Arc;

use wireboard_core::config::ServerConfig;
use wireboard_kits::NodeHandlers;
use wireboard_runtime::{SecretTunnel, StaticSecrets};

use crate::sessions::SessionKeepers;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub handlers: Arc<NodeHandlers>,
    pub sessions: SessionKeepers,
    pub secrets: Arc<StaticSecrets>,
    /// Compiled from `server.tunnels` at startup.
    pub tunnels: HashMap<String, SecretTunnel>,
}
