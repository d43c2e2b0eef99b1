//! Common validation utilities for query parameters.

use chrono::NaiveDate;
use thiserror::Error;

/// Error type for query parameter validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("invalid {param}: expected YYYY-MM-DD, got '{value}'")]
    InvalidDate { param: &'static str, value: String },
    #[error("invalid {param}: '{value}'")]
    InvalidValue { param: &'static str, value: String },
}

/// Parses a date-only query parameter (`YYYY-MM-DD`).
///
/// Empty values are treated as absent.
pub fn parse_date_param(
    param: &'static str,
    value: Option<&str>,
) -> Result<Option<NaiveDate>, ParamError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ParamError::InvalidDate {
                param,
                value: raw.to_string(),
            }),
    }
}

/// Returns the trimmed value, or `None` when absent or blank.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
