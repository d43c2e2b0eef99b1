//! Domain models for the export service.

pub mod archive_meta;
pub mod event;
pub mod export;
pub mod export_api;

pub use archive_meta::{ExportMeta, FileMeta, HELP_STRING};
pub use event::{CloudEvent, ResourceRequest};
pub use export::{
    aggregate_status, archive_key, request_prefix, source_object_key, ExportRequest,
    ExportSource, NewExportRequest, NewExportSource, Owner, PayloadFormat, RequestStatus,
    SourceError, SourceStatus, DEFAULT_EXPIRY_DAYS,
};
pub use export_api::{
    CreateExportRequest, CreateSourceRequest, ExportFilter, ExportStatusResponse, ExportSummary,
    ListExportsQuery, SortField, SortKey, SourceStatusResponse,
};
