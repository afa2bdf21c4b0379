use http::HeaderMap;

use wireboard_core::config::ServerConfig;

/// Bearer check for proxy requests.
///
/// An unset `server.token` leaves the endpoint open; otherwise the bearer
/// must match exactly.
pub fn validate_bearer(config: &ServerConfig, bearer: Option<&str>) -> bool {
    match config.token.as_deref() {
        None => true,
        Some(expected) => bearer == Some(expected),
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}
