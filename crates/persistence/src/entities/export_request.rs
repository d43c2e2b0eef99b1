//! Export request entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use domain::models::{ExportRequest, ExportSource, Owner, PayloadFormat, RequestStatus};

/// Database row mapping for the export_requests table.
#[derive(Debug, Clone, FromRow)]
pub struct ExportRequestEntity {
    pub id: Uuid,
    pub account_id: String,
    pub organization_id: String,
    pub username: String,
    pub name: String,
    pub format: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub archive_key: Option<String>,
}

impl ExportRequestEntity {
    /// Combines the row with its already-loaded sources.
    pub fn into_domain(self, sources: Vec<ExportSource>) -> ExportRequest {
        ExportRequest {
            id: self.id,
            owner: Owner {
                account_id: self.account_id,
                organization_id: self.organization_id,
                username: self.username,
            },
            name: self.name,
            format: self.format.parse().unwrap_or(PayloadFormat::Json),
            status: self.status.parse().unwrap_or(RequestStatus::Pending),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            expires_at: Some(self.expires_at),
            archive_key: self.archive_key,
            sources,
        }
    }
}
