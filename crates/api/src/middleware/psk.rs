//! Pre-shared key check for the internal API.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use shared::crypto::psk_matches;

use crate::app::AppState;
use crate::error::ApiError;

/// Header carrying the pre-shared key.
pub const PSK_HEADER: &str = "x-rh-exports-psk";

/// Rejects internal requests whose `x-rh-exports-psk` is not configured.
pub async fn require_psk(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let candidate = req
        .headers()
        .get(PSK_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if psk_matches(candidate, &state.config.security.psks) {
        next.run(req).await
    } else {
        tracing::warn!(path = %req.uri().path(), "Rejected internal request with invalid PSK");
        ApiError::Unauthorized("invalid pre-shared key".into()).into_response()
    }
}
