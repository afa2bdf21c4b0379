use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;

use wireboard_core::protocol::{ProxyErrorPayload, SESSION_HEADER};

use crate::auth;
use crate::state::AppState;

/// Extractor that validates the bearer token.
pub struct Authenticated;

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = StatusCode;

    fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let ok = auth::validate_bearer(&state.config, auth::extract_bearer(&parts.headers));
        async move {
            if ok {
                Ok(Authenticated)
            } else {
                Err(StatusCode::UNAUTHORIZED)
            }
        }
    }
}

/// The caller's harness session, from the session header.
pub struct Session(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = (StatusCode, Json<ProxyErrorPayload>);

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let session = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        async move {
            session.map(Session).ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(ProxyErrorPayload::new(
                        "rejected",
                        format!("Missing {} header", SESSION_HEADER),
                    )),
                )
            })
        }
    }
}
