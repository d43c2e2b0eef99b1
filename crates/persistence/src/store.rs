//! The request store contract shared by the PostgreSQL and in-memory backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::models::{
    request_prefix, ExportFilter, ExportRequest, NewExportRequest, Owner, RequestStatus,
    SourceError, SourceStatus,
};
use shared::pagination::Page;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by an [`ExportStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("export not found")]
    NotFound,

    #[error("this resource has already been processed")]
    AlreadyTerminal,

    #[error("{0}")]
    InvalidInput(String),

    #[error("stored data is invalid: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A request removed by the expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredExport {
    pub id: Uuid,
    pub organization_id: String,
    pub archive_key: Option<String>,
}

impl ExpiredExport {
    /// Prefix holding the request's source objects.
    pub fn object_prefix(&self) -> String {
        request_prefix(&self.organization_id, self.id)
    }
}

/// Durable record of export requests and their sources.
///
/// Every method is atomic with respect to concurrent callers. In particular
/// `update_source` serializes writes per source so that exactly one terminal
/// write wins and every other caller observes [`StoreError::AlreadyTerminal`].
#[async_trait]
pub trait ExportStore: Send + Sync {
    /// Inserts the request and all of its sources, assigning ids and timestamps.
    async fn create(&self, new: NewExportRequest) -> Result<ExportRequest, StoreError>;

    /// Loads a request without checking ownership.
    async fn get(&self, id: Uuid) -> Result<ExportRequest, StoreError>;

    /// Loads a request only if it belongs to `owner`.
    async fn get_for_owner(&self, id: Uuid, owner: &Owner) -> Result<ExportRequest, StoreError>;

    /// Returns the total number of matches and the requested page.
    async fn list(
        &self,
        owner: &Owner,
        filter: &ExportFilter,
        page: Page,
    ) -> Result<(i64, Vec<ExportRequest>), StoreError>;

    async fn delete(&self, id: Uuid, owner: &Owner) -> Result<(), StoreError>;

    /// Moves a pending source to `success` or `failed`.
    async fn update_source(
        &self,
        request_id: Uuid,
        source_id: Uuid,
        status: SourceStatus,
        error: Option<SourceError>,
    ) -> Result<(), StoreError>;

    /// Moves the request from `pending` to `running`.
    ///
    /// Returns `true` when this call performed the transition.
    async fn start_request(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Writes the request status. A second archive key is rejected with
    /// [`StoreError::AlreadyTerminal`].
    async fn set_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
        archive_key: Option<String>,
    ) -> Result<(), StoreError>;

    /// Removes every request whose `expires_at` has passed and returns what
    /// was removed, so the caller can clean up its objects.
    async fn delete_expired(&self) -> Result<Vec<ExpiredExport>, StoreError>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Checks that apply to every backend before anything is written.
pub(crate) fn validate_new_request(
    new: &NewExportRequest,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if new.sources.is_empty() {
        return Err(StoreError::InvalidInput(
            "at least one source is required".to_string(),
        ));
    }
    if let Some(expires_at) = new.expires_at {
        if expires_at <= now {
            return Err(StoreError::InvalidInput(
                "expires_at must be in the future".to_string(),
            ));
        }
    }
    if new.sources.iter().any(|s| !s.filters.is_object()) {
        return Err(StoreError::InvalidInput(
            "filters must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

/// Only `pending -> success|failed` is a legal source transition.
pub(crate) fn check_source_transition(
    current: SourceStatus,
    next: SourceStatus,
) -> Result<(), StoreError> {
    if !next.is_terminal() {
        return Err(StoreError::InvalidInput(format!(
            "source cannot be moved to {}",
            next
        )));
    }
    if current.is_terminal() {
        return Err(StoreError::AlreadyTerminal);
    }
    Ok(())
}
