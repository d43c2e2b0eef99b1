//! Shared utilities and common types for the export service.
//!
//! This crate provides common functionality used across all other crates:
//! - Pagination envelope and link generation
//! - `x-rh-identity` header decoding
//! - Pre-shared key comparison
//! - Query parameter validation

pub mod crypto;
pub mod identity;
pub mod pagination;
pub mod validation;
