//! Export API payloads and list query parsing.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use shared::pagination::Page;
use shared::validation::{non_blank, parse_date_param, ParamError};
use uuid::Uuid;
use validator::Validate;

use super::export::{
    ExportRequest, ExportSource, PayloadFormat, RequestStatus, SourceError, SourceStatus,
};

/// Request payload for creating an export.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateExportRequest {
    #[validate(length(min = 1, max = 255, message = "name must be 1-255 characters"))]
    pub name: String,

    /// Parsed separately so an unknown value yields a precise message.
    pub format: String,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[validate(
        length(min = 1, message = "at least one source is required"),
        nested
    )]
    pub sources: Vec<CreateSourceRequest>,
}

/// One source in a create payload.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSourceRequest {
    #[validate(length(min = 1, max = 255, message = "application must be 1-255 characters"))]
    pub application: String,

    #[validate(length(min = 1, max = 255, message = "resource must be 1-255 characters"))]
    pub resource: String,

    #[serde(default = "empty_filters")]
    #[validate(custom(function = "validate_filters"))]
    pub filters: serde_json::Value,
}

fn empty_filters() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Filters are passed through to upstream applications and must be a JSON object.
fn validate_filters(filters: &serde_json::Value) -> Result<(), validator::ValidationError> {
    if filters.is_object() {
        Ok(())
    } else {
        let mut err = validator::ValidationError::new("filters_object");
        err.message = Some("filters must be a JSON object".into());
        Err(err)
    }
}

/// List entry for an export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportSummary {
    pub id: Uuid,
    pub name: String,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    pub format: PayloadFormat,
    pub status: RequestStatus,
}

impl From<&ExportRequest> for ExportSummary {
    fn from(r: &ExportRequest) -> Self {
        Self {
            id: r.id,
            name: r.name.clone(),
            created: r.created_at,
            completed: r.completed_at,
            expires: r.expires_at,
            format: r.format,
            status: r.status,
        }
    }
}

/// Per-source status as exposed to the owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceStatusResponse {
    pub id: Uuid,
    pub application: String,
    pub resource: String,
    pub filters: serde_json::Value,
    pub status: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SourceError>,
}

impl From<&ExportSource> for SourceStatusResponse {
    fn from(s: &ExportSource) -> Self {
        Self {
            id: s.id,
            application: s.application.clone(),
            resource: s.resource.clone(),
            filters: s.filters.clone(),
            status: s.status,
            error: s.error.clone(),
        }
    }
}

/// Response for create and status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportStatusResponse {
    #[serde(flatten)]
    pub summary: ExportSummary,
    pub sources: Vec<SourceStatusResponse>,
}

impl From<&ExportRequest> for ExportStatusResponse {
    fn from(r: &ExportRequest) -> Self {
        Self {
            summary: ExportSummary::from(r),
            sources: r.sources.iter().map(SourceStatusResponse::from).collect(),
        }
    }
}

/// Sortable list columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Created,
    Expires,
    Application,
    Resource,
}

impl SortField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(SortField::Name),
            "created" => Some(SortField::Created),
            "expires" => Some(SortField::Expires),
            "application" => Some(SortField::Application),
            "resource" => Some(SortField::Resource),
            _ => None,
        }
    }
}

/// One sort key; a leading `-` in the query reverses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

impl SortKey {
    /// Parses a comma-separated sort parameter. Unknown keys are ignored.
    pub fn parse_list(raw: &str) -> Vec<SortKey> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| {
                let (descending, name) = match s.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, s),
                };
                SortField::parse(name).map(|field| SortKey { field, descending })
            })
            .collect()
    }
}

/// Validated list filter handed to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportFilter {
    /// Substring of the export name.
    pub name: Option<String>,
    /// Some source has this application.
    pub application: Option<String>,
    /// Some source has this resource.
    pub resource: Option<String>,
    /// UTC calendar date of creation.
    pub created: Option<NaiveDate>,
    /// UTC calendar date of expiry.
    pub expires: Option<NaiveDate>,
    pub status: Option<RequestStatus>,
    pub sort: Vec<SortKey>,
}

/// Raw query parameters for `GET /exports`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListExportsQuery {
    pub name: Option<String>,
    pub created: Option<String>,
    pub expires: Option<String>,
    pub application: Option<String>,
    pub resource: Option<String>,
    pub status: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl ListExportsQuery {
    /// Validates the query into a store filter and paging window.
    pub fn parse(&self) -> Result<(ExportFilter, Page), String> {
        let page = Page::parse(self.limit.as_deref(), self.offset.as_deref())
            .map_err(|e| e.to_string())?;

        let status = match non_blank(self.status.as_deref()) {
            Some(raw) => Some(raw.parse::<RequestStatus>().map_err(|_| {
                ParamError::InvalidValue {
                    param: "status",
                    value: raw.to_string(),
                }
                .to_string()
            })?),
            None => None,
        };

        let filter = ExportFilter {
            name: non_blank(self.name.as_deref()).map(str::to_string),
            application: non_blank(self.application.as_deref()).map(str::to_string),
            resource: non_blank(self.resource.as_deref()).map(str::to_string),
            created: parse_date_param("created", self.created.as_deref())
                .map_err(|e| e.to_string())?,
            expires: parse_date_param("expires", self.expires.as_deref())
                .map_err(|e| e.to_string())?,
            status,
            sort: self
                .sort
                .as_deref()
                .map(SortKey::parse_list)
                .unwrap_or_default(),
        };

        Ok((filter, page))
    }

    /// Non-paging parameters to carry into pagination links.
    pub fn link_params(&self) -> Vec<(String, String)> {
        [
            ("name", &self.name),
            ("created", &self.created),
            ("expires", &self.expires),
            ("application", &self.application),
            ("resource", &self.resource),
            ("status", &self.status),
            ("sort", &self.sort),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::export::Owner;
    use fake::faker::lorem::en::Word;
    use fake::Fake;

    fn sample_request() -> ExportRequest {
        let now = Utc::now();
        ExportRequest {
            id: Uuid::new_v4(),
            owner: Owner {
                account_id: "1".into(),
                organization_id: "org".into(),
                username: "user".into(),
            },
            name: Word().fake(),
            format: PayloadFormat::Json,
            status: RequestStatus::Partial,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
            expires_at: None,
            archive_key: Some("org/key.tar.gz".into()),
            sources: vec![ExportSource {
                id: Uuid::new_v4(),
                application: "appB".into(),
                resource: "res2".into(),
                filters: serde_json::json!({}),
                status: SourceStatus::Failed,
                error: Some(SourceError {
                    message: "boom".into(),
                    code: 7,
                }),
            }],
        }
    }

    #[test]
    fn test_create_request_deserialization() {
        let json = r#"{
            "name": "my export",
            "format": "json",
            "sources": [
                {"application": "appA", "resource": "res1", "filters": {"a": "b"}},
                {"application": "appB", "resource": "res2"}
            ]
        }"#;
        let request: CreateExportRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.sources.len(), 2);
        assert!(request.expires_at.is_none());
        assert!(request.sources[1].filters.is_object());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_create_request_requires_sources() {
        let json = r#"{"name": "x", "format": "csv", "sources": []}"#;
        let request: CreateExportRequest = serde_json::from_str(json).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_create_request_rejects_non_object_filters() {
        let json = r#"{"name": "x", "format": "csv",
            "sources": [{"application": "a", "resource": "r", "filters": [1, 2]}]}"#;
        let request: CreateExportRequest = serde_json::from_str(json).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_nested_source_errors_are_reported_per_index() {
        let json = r#"{"name": "x", "format": "csv",
            "sources": [
                {"application": "a", "resource": "r"},
                {"application": "", "resource": "r"}
            ]}"#;
        let request: CreateExportRequest = serde_json::from_str(json).unwrap();
        let errors = request.validate().unwrap_err();
        let rendered = serde_json::to_value(&errors).unwrap();
        assert!(rendered["sources"].to_string().contains("application"));

        // Payloads are serializable so they can be echoed back in logs and tests.
        let echoed = serde_json::to_value(&request).unwrap();
        assert_eq!(echoed["sources"][1]["filters"], serde_json::json!({}));
    }

    #[test]
    fn test_status_response_shape() {
        let request = sample_request();
        let json = serde_json::to_value(ExportStatusResponse::from(&request)).unwrap();

        assert_eq!(json["id"], request.id.to_string());
        assert_eq!(json["status"], "partial");
        assert_eq!(json["format"], "json");
        assert!(json.get("expires").is_none());
        assert!(json.get("completed").is_some());
        assert_eq!(json["sources"][0]["error"]["message"], "boom");
        assert_eq!(json["sources"][0]["error"]["code"], 7);
    }

    #[test]
    fn test_sort_key_parsing() {
        let keys = SortKey::parse_list("name,-created,bogus,-application");
        assert_eq!(
            keys,
            vec![
                SortKey {
                    field: SortField::Name,
                    descending: false
                },
                SortKey {
                    field: SortField::Created,
                    descending: true
                },
                SortKey {
                    field: SortField::Application,
                    descending: true
                },
            ]
        );
        assert!(SortKey::parse_list("unknown").is_empty());
    }

    #[test]
    fn test_list_query_parse() {
        let query = ListExportsQuery {
            name: Some("report".into()),
            created: Some("2024-01-02".into()),
            status: Some("complete".into()),
            sort: Some("-expires".into()),
            limit: Some("10".into()),
            offset: Some("20".into()),
            ..Default::default()
        };
        let (filter, page) = query.parse().unwrap();
        assert_eq!(filter.name.as_deref(), Some("report"));
        assert_eq!(filter.created, NaiveDate::from_ymd_opt(2024, 1, 2));
        assert_eq!(filter.status, Some(RequestStatus::Complete));
        assert_eq!(filter.sort.len(), 1);
        assert_eq!(page.limit, 10);
        assert_eq!(page.offset, 20);
    }

    #[test]
    fn test_list_query_rejects_bad_paging() {
        let query = ListExportsQuery {
            limit: Some("ten".into()),
            ..Default::default()
        };
        assert!(query.parse().unwrap_err().contains("limit"));
    }

    #[test]
    fn test_list_query_rejects_bad_status() {
        let query = ListExportsQuery {
            status: Some("done".into()),
            ..Default::default()
        };
        assert!(query.parse().unwrap_err().contains("status"));
    }

    #[test]
    fn test_link_params_skip_paging() {
        let query = ListExportsQuery {
            name: Some("a".into()),
            limit: Some("5".into()),
            ..Default::default()
        };
        assert_eq!(
            query.link_params(),
            vec![("name".to_string(), "a".to_string())]
        );
    }
}
