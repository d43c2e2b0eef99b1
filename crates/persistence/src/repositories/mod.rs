//! Repository implementations for database operations.

pub mod export;

pub use export::ExportRepository;
