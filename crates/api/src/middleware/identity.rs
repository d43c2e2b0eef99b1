//! Caller identity middleware for the public API.

use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use shared::identity::{decode_identity, IDENTITY_HEADER};

use crate::error::ApiError;

/// Decodes `x-rh-identity` and stores the [`shared::identity::Identity`] in
/// request extensions. Requests without a usable identity get a 401.
pub async fn require_identity(mut req: Request<Body>, next: Next) -> Response {
    let header = match req
        .headers()
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(value) => value.to_string(),
        None => {
            return ApiError::Unauthorized("missing x-rh-identity header".into()).into_response()
        }
    };

    match decode_identity(&header) {
        Ok(identity) => {
            tracing::debug!(org_id = %identity.org_id, "Identity accepted");
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => ApiError::Unauthorized(e.to_string()).into_response(),
    }
}
