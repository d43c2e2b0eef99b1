//! Export request domain model.
//!
//! An export request fans out to one source per upstream application. The
//! request status is derived from its sources until the archive step decides
//! the terminal outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Default lifetime of an export request.
pub const DEFAULT_EXPIRY_DAYS: i64 = 7;

/// Payload format requested from upstream applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Csv,
    Json,
}

impl PayloadFormat {
    /// File extension used for per-source objects.
    pub fn extension(&self) -> &'static str {
        match self {
            PayloadFormat::Csv => "csv",
            PayloadFormat::Json => "json",
        }
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for PayloadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(PayloadFormat::Csv),
            "json" => Ok(PayloadFormat::Json),
            _ => Err(format!("unknown payload format: {}", s)),
        }
    }
}

/// Lifecycle status of an export request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Running,
    Complete,
    Partial,
    Failed,
}

impl RequestStatus {
    /// Whether the request has reached a final outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Complete | RequestStatus::Partial | RequestStatus::Failed
        )
    }

    /// Whether an archive exists for a request in this status.
    pub fn has_archive(&self) -> bool {
        matches!(self, RequestStatus::Complete | RequestStatus::Partial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Running => "running",
            RequestStatus::Complete => "complete",
            RequestStatus::Partial => "partial",
            RequestStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "running" => Ok(RequestStatus::Running),
            "complete" => Ok(RequestStatus::Complete),
            "partial" => Ok(RequestStatus::Partial),
            "failed" => Ok(RequestStatus::Failed),
            _ => Err(format!("unknown export status: {}", s)),
        }
    }
}

/// Status of one upstream application's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Pending,
    Success,
    Failed,
}

impl SourceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SourceStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Success => "success",
            SourceStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SourceStatus::Pending),
            "success" => Ok(SourceStatus::Success),
            "failed" => Ok(SourceStatus::Failed),
            _ => Err(format!("unknown source status: {}", s)),
        }
    }
}

/// The user an export belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub account_id: String,
    pub organization_id: String,
    pub username: String,
}

/// Error reported by (or on behalf of) an upstream application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceError {
    pub message: String,
    pub code: i32,
}

/// One upstream application's portion of an export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSource {
    pub id: Uuid,
    pub application: String,
    pub resource: String,
    pub filters: serde_json::Value,
    pub status: SourceStatus,
    pub error: Option<SourceError>,
}

/// An export job initiated by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub id: Uuid,
    pub owner: Owner,
    pub name: String,
    pub format: PayloadFormat,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub archive_key: Option<String>,
    pub sources: Vec<ExportSource>,
}

impl ExportRequest {
    pub fn source(&self, source_id: Uuid) -> Option<&ExportSource> {
        self.sources.iter().find(|s| s.id == source_id)
    }

    /// Status derived from the current source statuses.
    pub fn aggregate_status(&self) -> RequestStatus {
        aggregate_status(self.sources.iter().map(|s| s.status))
    }

    /// Object-store prefix holding the per-source uploads.
    pub fn object_prefix(&self) -> String {
        request_prefix(&self.owner.organization_id, self.id)
    }

    /// Object-store key for one source's upload.
    pub fn source_key(&self, source_id: Uuid) -> String {
        source_object_key(&self.owner.organization_id, self.id, source_id, self.format)
    }
}

/// Input for creating an export request. IDs are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExportRequest {
    pub owner: Owner,
    pub name: String,
    pub format: PayloadFormat,
    pub expires_at: Option<DateTime<Utc>>,
    pub sources: Vec<NewExportSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExportSource {
    pub application: String,
    pub resource: String,
    pub filters: serde_json::Value,
}

/// Derives the request status from its sources' statuses.
///
/// | condition | result |
/// |---|---|
/// | any source pending | `Pending` |
/// | all failed | `Failed` |
/// | all succeeded | `Complete` |
/// | otherwise | `Partial` |
///
/// An empty source list is treated as pending; the store never persists one.
pub fn aggregate_status<I>(statuses: I) -> RequestStatus
where
    I: IntoIterator<Item = SourceStatus>,
{
    let (mut total, mut success, mut failed) = (0usize, 0usize, 0usize);
    for status in statuses {
        total += 1;
        match status {
            SourceStatus::Success => success += 1,
            SourceStatus::Failed => failed += 1,
            SourceStatus::Pending => {}
        }
    }

    if total == 0 || success + failed < total {
        RequestStatus::Pending
    } else if failed == total {
        RequestStatus::Failed
    } else if success == total {
        RequestStatus::Complete
    } else {
        RequestStatus::Partial
    }
}

/// `<org_id>/<request_id>/`
pub fn request_prefix(org_id: &str, request_id: Uuid) -> String {
    format!("{}/{}/", org_id, request_id)
}

/// `<org_id>/<request_id>/<source_id>.<format>`
pub fn source_object_key(
    org_id: &str,
    request_id: Uuid,
    source_id: Uuid,
    format: PayloadFormat,
) -> String {
    format!(
        "{}{}.{}",
        request_prefix(org_id, request_id),
        source_id,
        format.extension()
    )
}

/// `<org_id>/<YYYY-MM-DDTHH:MM:SSZ>-<request_id>.tar.gz`
///
/// The extension is kept for compatibility with existing consumers; the
/// object is a ZIP archive.
pub fn archive_key(org_id: &str, timestamp: DateTime<Utc>, request_id: Uuid) -> String {
    format!(
        "{}/{}-{}.tar.gz",
        org_id,
        timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
        request_id
    )
}
