//! Callbacks used by upstream applications to deliver results.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::StatusCode,
};
use domain::models::SourceError;
use futures::{StreamExt, TryStreamExt};

use super::exports::parse_id;
use crate::app::AppState;
use crate::error::ApiError;
use crate::services::object_store::ObjectStoreError;

/// POST /:request_id/:application/:resource_id/upload
///
/// Answers 202 once the whole body has been received; the object-store
/// upload runs in the background.
pub async fn upload_source(
    State(state): State<AppState>,
    Path((request_id, application, source_id)): Path<(String, String, String)>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let request_id = parse_id(&request_id, "export")?;
    let source_id = parse_id(&source_id, "resource")?;

    let stream = body
        .into_data_stream()
        .map_err(|e| ObjectStoreError::Body(e.to_string()))
        .boxed();

    state
        .controller
        .on_source_upload(request_id, source_id, &application, stream)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /:request_id/:application/:resource_id/error
///
/// The body is parsed as JSON whatever `Content-Type` the caller sent.
pub async fn source_error(
    State(state): State<AppState>,
    Path((request_id, application, source_id)): Path<(String, String, String)>,
    payload: Bytes,
) -> Result<StatusCode, ApiError> {
    let request_id = parse_id(&request_id, "export")?;
    let source_id = parse_id(&source_id, "resource")?;
    let error: SourceError = serde_json::from_slice(&payload)
        .map_err(|e| ApiError::InvalidInput(format!("invalid error body: {}", e)))?;

    state
        .controller
        .on_source_error(request_id, source_id, &application, error)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
