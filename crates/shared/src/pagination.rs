//! Offset-based pagination utilities.
//!
//! List endpoints answer with a `{meta, links, data}` envelope. Links carry the
//! caller's filter and sort parameters so a client can follow them verbatim.

use serde::Serialize;
use thiserror::Error;

/// Default page size when the caller does not send `limit`.
pub const DEFAULT_LIMIT: i64 = 100;

/// Error type for paging parameter parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("invalid offset: {0}")]
    InvalidOffset(String),
}

/// Validated paging window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    /// Parses raw `limit`/`offset` query values.
    ///
    /// `limit` must be at least 1 and `offset` non-negative.
    pub fn parse(limit: Option<&str>, offset: Option<&str>) -> Result<Self, PageError> {
        let limit = match limit {
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(value) if value >= 1 => value,
                _ => return Err(PageError::InvalidLimit(raw.to_string())),
            },
            None => DEFAULT_LIMIT,
        };

        let offset = match offset {
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(value) if value >= 0 => value,
                _ => return Err(PageError::InvalidOffset(raw.to_string())),
            },
            None => 0,
        };

        Ok(Self { limit, offset })
    }
}

/// `meta` section of the envelope.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageMeta {
    pub count: i64,
}

/// `links` section of the envelope. Absent links serialize as `null`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageLinks {
    pub first: String,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub last: Option<String>,
}

/// Paginated list response.
#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub meta: PageMeta,
    pub links: PageLinks,
    pub data: Vec<T>,
}

impl<T> Paginated<T> {
    /// Wraps a page of results with its links.
    pub fn new(
        data: Vec<T>,
        count: i64,
        page: Page,
        base_path: &str,
        params: &[(String, String)],
    ) -> Self {
        Self {
            meta: PageMeta { count },
            links: build_links(base_path, params, count, page),
            data,
        }
    }
}

/// Offset of the next page, if one exists.
pub fn next_offset(count: i64, limit: i64, offset: i64) -> Option<i64> {
    let next = offset.saturating_add(limit);
    (next < count).then_some(next)
}

/// Offset of the previous page; `None` on the first page.
pub fn previous_offset(limit: i64, offset: i64) -> Option<i64> {
    (offset > 0).then(|| (offset - limit).max(0))
}

/// Offset of the last page; `None` when everything fits in one page.
pub fn last_offset(count: i64, limit: i64) -> Option<i64> {
    (count > limit).then(|| count - limit)
}

/// Builds the `first/next/previous/last` links for a list response.
///
/// `params` are the non-paging query parameters to carry along.
pub fn build_links(
    base_path: &str,
    params: &[(String, String)],
    count: i64,
    page: Page,
) -> PageLinks {
    let link = |offset: i64| page_url(base_path, params, page.limit, offset);

    PageLinks {
        first: link(0),
        next: next_offset(count, page.limit, page.offset).map(link),
        previous: previous_offset(page.limit, page.offset).map(link),
        last: last_offset(count, page.limit).map(link),
    }
}

fn page_url(base_path: &str, params: &[(String, String)], limit: i64, offset: i64) -> String {
    let mut query: Vec<String> = params
        .iter()
        .filter(|(key, _)| key != "limit" && key != "offset")
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect();
    query.push(format!("limit={limit}"));
    query.push(format!("offset={offset}"));

    format!("{}?{}", base_path, query.join("&"))
}
