use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::{info, warn};

use wireboard_core::error::WireboardError;
use wireboard_core::protocol::{ProxyErrorPayload, ProxyRequest, ProxyResponse};
use wireboard_runtime::ProxyReceiver;

use crate::middleware::{Authenticated, Session};
use crate::state::AppState;

// GET /api/health (no auth required)
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /proxy
pub async fn proxy(
    _auth: Authenticated,
    Session(session): Session,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProxyRequest>,
) -> Result<Json<ProxyResponse>, (StatusCode, Json<ProxyErrorPayload>)> {
    let node_id = request.node.id.clone();
    let node_type = request.node.node_type.clone();
    info!(session = %session, node_id = %node_id, node_type = %node_type, "Proxy request");

    let receiver = ProxyReceiver::new(state.handlers.clone(), state.config.proxy_nodes.clone())
        .with_keeper(state.sessions.keeper_for(&session))
        .with_resolver(state.secrets.clone())
        .with_tunnels(state.tunnels.clone());

    match receiver.handle(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!(session = %session, node_id = %node_id, error = %e, "Proxy request failed");
            Err((status_for(&e), Json(ProxyErrorPayload::from_error(&e))))
        }
    }
}

fn status_for(err: &WireboardError) -> StatusCode {
    match err {
        WireboardError::ProxyRejected(_) => StatusCode::FORBIDDEN,
        WireboardError::MissingSecret(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WireboardError::HandlerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_kind() {
        assert_eq!(
            status_for(&WireboardError::ProxyRejected("no".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&WireboardError::MissingSecret("KEY".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&WireboardError::Handler("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
