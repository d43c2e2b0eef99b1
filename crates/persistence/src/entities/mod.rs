//! Database entity definitions.
//!
//! Entities are direct mappings to database rows.

pub mod export_request;
pub mod export_source;

pub use export_request::ExportRequestEntity;
pub use export_source::ExportSourceEntity;
