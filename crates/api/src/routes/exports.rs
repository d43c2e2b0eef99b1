//! Public export endpoints.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use domain::models::{
    CreateExportRequest, ExportStatusResponse, ExportSummary, ListExportsQuery, NewExportRequest,
    NewExportSource, PayloadFormat,
};
use shared::pagination::Paginated;
use uuid::Uuid;
use validator::Validate;

use crate::app::AppState;
use crate::error::ApiError;
use crate::extractors::CallerIdentity;
use crate::services::assembler::ARCHIVE_CONTENT_TYPE;

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::InvalidInput(format!("invalid {} id: {}", what, raw)))
}

/// POST /exports
///
/// Persists the request and returns 202 before the announce messages are
/// published.
pub async fn create_export(
    State(state): State<AppState>,
    caller: CallerIdentity,
    payload: Result<Json<CreateExportRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ExportStatusResponse>), ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::InvalidInput(e.body_text()))?;

    let format: PayloadFormat = body.format.parse().map_err(ApiError::InvalidInput)?;
    body.validate()?;

    let new = NewExportRequest {
        owner: caller.owner(),
        name: body.name,
        format,
        expires_at: body.expires_at,
        sources: body
            .sources
            .into_iter()
            .map(|s| NewExportSource {
                application: s.application,
                resource: s.resource,
                filters: s.filters,
            })
            .collect(),
    };

    let request = state
        .controller
        .create(new, caller.raw().to_string())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ExportStatusResponse::from(&request)),
    ))
}

/// GET /exports
pub async fn list_exports(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Query(query): Query<ListExportsQuery>,
) -> Result<Json<Paginated<ExportSummary>>, ApiError> {
    let (filter, page) = query.parse().map_err(ApiError::InvalidInput)?;

    let (count, requests) = state
        .controller
        .list(&caller.owner(), &filter, page)
        .await?;

    let base_path = format!("{}/exports", state.config.server.public_base_path);
    Ok(Json(Paginated::new(
        requests.iter().map(ExportSummary::from).collect(),
        count,
        page,
        &base_path,
        &query.link_params(),
    )))
}

/// GET /exports/:id/status
pub async fn get_export_status(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> Result<Json<ExportStatusResponse>, ApiError> {
    let id = parse_id(&id, "export")?;
    let request = state.controller.get_status(&caller.owner(), id).await?;
    Ok(Json(ExportStatusResponse::from(&request)))
}

/// GET /exports/:id
///
/// Streams the archive of a complete or partial export.
pub async fn get_export(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, "export")?;
    let archive = state.controller.get_archive(&caller.owner(), id).await?;

    Ok((
        [
            (header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", archive.filename),
            ),
        ],
        Body::from_stream(archive.body),
    )
        .into_response())
}

/// DELETE /exports/:id
pub async fn delete_export(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id, "export")?;
    state.controller.delete(&caller.owner(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}
