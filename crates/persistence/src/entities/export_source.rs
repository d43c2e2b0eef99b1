//! Export source entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use domain::models::{ExportSource, SourceError, SourceStatus};

/// Database row mapping for the export_sources table.
#[derive(Debug, Clone, FromRow)]
pub struct ExportSourceEntity {
    pub id: Uuid,
    pub export_request_id: Uuid,
    pub position: i32,
    pub application: String,
    pub resource: String,
    pub filters: serde_json::Value,
    pub status: String,
    pub error_message: Option<String>,
    pub error_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ExportSourceEntity> for ExportSource {
    fn from(entity: ExportSourceEntity) -> Self {
        let error = match (entity.error_message, entity.error_code) {
            (Some(message), Some(code)) => Some(SourceError { message, code }),
            (Some(message), None) => Some(SourceError { message, code: 0 }),
            _ => None,
        };

        Self {
            id: entity.id,
            application: entity.application,
            resource: entity.resource,
            filters: entity.filters,
            status: entity.status.parse().unwrap_or(SourceStatus::Pending),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_entity() -> ExportSourceEntity {
        ExportSourceEntity {
            id: Uuid::new_v4(),
            export_request_id: Uuid::new_v4(),
            position: 0,
            application: "inventory".to_string(),
            resource: "hosts".to_string(),
            filters: serde_json::json!({"stale": false}),
            status: "failed".to_string(),
            error_message: Some("boom".to_string()),
            error_code: Some(7),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_failed_source_carries_error() {
        let source: ExportSource = create_test_entity().into();
        assert_eq!(source.status, SourceStatus::Failed);
        assert_eq!(
            source.error,
            Some(SourceError {
                message: "boom".to_string(),
                code: 7
            })
        );
        assert_eq!(source.filters["stale"], false);
    }

    #[test]
    fn test_pending_source_has_no_error() {
        let mut entity = create_test_entity();
        entity.status = "pending".to_string();
        entity.error_message = None;
        entity.error_code = None;

        let source: ExportSource = entity.into();
        assert_eq!(source.status, SourceStatus::Pending);
        assert!(source.error.is_none());
    }
}
