//! HTTP Basic authentication middleware.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;

use super::AppState;

/// Validate `Authorization: Basic ...` when auth is enabled; otherwise the
/// request passes straight through (the bypass is announced at startup).
pub async fn basic_auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.api_auth_enabled {
        return next.run(req).await;
    }

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .map(|credentials| {
            let mut parts = credentials.splitn(2, ':');
            let user = parts.next().unwrap_or_default();
            let pass = parts.next().unwrap_or_default();
            user == state.config.api_username && pass == state.config.api_password
        })
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"Login Required\"")],
            "Authentication required",
        )
            .into_response()
    }
}
