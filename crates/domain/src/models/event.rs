//! Outbound CloudEvents messages sent to upstream applications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::export::{ExportRequest, ExportSource, PayloadFormat};

pub const EVENT_SOURCE: &str = "urn:redhat:source:console:app:export-service";
pub const EVENT_TYPE: &str = "com.redhat.console.export-service.request";
pub const EVENT_DATASCHEMA: &str =
    "https://console.redhat.com/api/schemas/apps/export-service/v1/resource-request.json";
pub const SPEC_VERSION: &str = "1.0";

/// Upstream-facing payload describing one source to export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub export_uuid: Uuid,
    pub format: PayloadFormat,
    pub application: String,
    pub resource_name: String,
    pub resource_uuid: Uuid,
    pub filters: serde_json::Value,
    pub x_rh_identity: String,
}

/// CloudEvents 1.0 envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent<T> {
    pub id: Uuid,
    pub source: String,
    pub subject: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub redhatorgid: String,
    pub dataschema: String,
    pub data: T,
}

impl CloudEvent<ResourceRequest> {
    /// Builds the announce message for one source of a request.
    pub fn resource_request(
        request: &ExportRequest,
        source: &ExportSource,
        identity_header: &str,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: EVENT_SOURCE.to_string(),
            subject: format!("urn:redhat:subject:export-service:request:{}", request.id),
            specversion: SPEC_VERSION.to_string(),
            event_type: EVENT_TYPE.to_string(),
            time,
            redhatorgid: request.owner.organization_id.clone(),
            dataschema: EVENT_DATASCHEMA.to_string(),
            data: ResourceRequest {
                export_uuid: request.id,
                format: request.format,
                application: source.application.clone(),
                resource_name: source.resource.clone(),
                resource_uuid: source.id,
                filters: source.filters.clone(),
                x_rh_identity: identity_header.to_string(),
            },
        }
    }
}
