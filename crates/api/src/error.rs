use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use persistence::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::lifecycle::LifecycleError;
use crate::services::object_store::ObjectStoreError;

/// Message returned when a source callback arrives after the source finished.
pub const ALREADY_PROCESSED: &str = "this resource has already been processed";

/// Message returned when the archive is requested before assembly finished.
pub const NOT_COMPLETE: &str = "export is not complete";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad state: {0}")]
    BadState(String),

    #[error("this resource has already been processed")]
    AlreadyTerminal,

    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub message: String,
    pub code: u16,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) | ApiError::BadState(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyTerminal => StatusCode::GONE,
            ApiError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::InvalidInput(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::NotFound(msg)
            | ApiError::BadState(msg) => msg,
            ApiError::AlreadyTerminal => ALREADY_PROCESSED.to_string(),
            ApiError::UpstreamFailure(msg) => {
                tracing::warn!("Upstream failure: {}", msg);
                msg
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
        };

        let body = ErrorBody {
            message,
            code: status.as_u16(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("export not found".into()),
            StoreError::AlreadyTerminal => ApiError::AlreadyTerminal,
            StoreError::InvalidInput(msg) => ApiError::InvalidInput(msg),
            StoreError::Corrupt(msg) => ApiError::Internal(msg),
            StoreError::Database(e) => ApiError::Internal(format!("Database error: {}", e)),
        }
    }
}

impl From<ObjectStoreError> for ApiError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(key) => {
                ApiError::NotFound(format!("object {} not found", key))
            }
            other => ApiError::UpstreamFailure(other.to_string()),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            LifecycleError::NotComplete => ApiError::BadState(NOT_COMPLETE.into()),
            LifecycleError::AlreadyTerminal => ApiError::AlreadyTerminal,
            LifecycleError::Store(e) => e.into(),
            LifecycleError::ObjectStore(e) => e.into(),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = Vec::new();
        collect_messages("", &errors, &mut messages);
        messages.sort();

        let message = match messages.len() {
            0 => "invalid request body".to_string(),
            1 => messages.remove(0),
            _ => messages.join("; "),
        };
        ApiError::InvalidInput(message)
    }
}

fn collect_messages(prefix: &str, errors: &validator::ValidationErrors, out: &mut Vec<String>) {
    use validator::ValidationErrorsKind;

    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            ValidationErrorsKind::Field(errs) => {
                for e in errs {
                    let msg = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("{} is invalid", path));
                    out.push(msg);
                }
            }
            ValidationErrorsKind::Struct(inner) => collect_messages(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    collect_messages(&format!("{}[{}]", path, index), inner, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> ErrorBody {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_codes_and_body_shape() {
        let cases = [
            (ApiError::InvalidInput("bad".into()), 400),
            (ApiError::Unauthorized("who".into()), 401),
            (ApiError::NotFound("gone".into()), 404),
            (ApiError::BadState(NOT_COMPLETE.into()), 400),
            (ApiError::AlreadyTerminal, 410),
            (ApiError::UpstreamFailure("s3".into()), 502),
            (ApiError::Internal("db".into()), 500),
        ];

        for (error, code) in cases {
            let response = error.into_response();
            assert_eq!(response.status().as_u16(), code);
            let body = body_of(response).await;
            assert_eq!(body.code, code);
        }
    }

    #[tokio::test]
    async fn test_already_terminal_message() {
        let body = body_of(ApiError::AlreadyTerminal.into_response()).await;
        assert_eq!(body.message, "this resource has already been processed");
    }

    #[tokio::test]
    async fn test_internal_message_is_hidden() {
        let body = body_of(ApiError::Internal("password=hunter2".into()).into_response()).await;
        assert_eq!(body.message, "An internal error occurred");
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            ApiError::from(StoreError::NotFound),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StoreError::AlreadyTerminal),
            ApiError::AlreadyTerminal
        ));
        assert!(matches!(
            ApiError::from(StoreError::InvalidInput("x".into())),
            ApiError::InvalidInput(_)
        ));
        assert!(matches!(
            ApiError::from(StoreError::Database(sqlx::Error::PoolTimedOut)),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_not_complete_maps_to_bad_state() {
        let err = ApiError::from(LifecycleError::NotComplete);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(err, ApiError::BadState(ref m) if m == NOT_COMPLETE));
    }
}
