//! Persistence layer for the export service.
//!
//! This crate contains:
//! - Database connection management
//! - Entity definitions (database row mappings)
//! - The `ExportStore` contract with PostgreSQL and in-memory implementations

pub mod db;
pub mod entities;
pub mod memory;
pub mod metrics;
pub mod repositories;
pub mod store;

pub use memory::{ManualClock, MemoryExportStore};
pub use repositories::ExportRepository;
pub use store::{ExpiredExport, ExportStore, StoreError};
