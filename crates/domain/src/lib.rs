//! Domain layer for the export service.
//!
//! This crate contains:
//! - Export request and source models with their lifecycle statuses
//! - The aggregation rule deriving a request status from its sources
//! - API payloads, archive metadata and outbound message shapes

pub mod models;
