//! `x-rh-identity` header decoding.
//!
//! The header is a base64-encoded JSON document produced by the gateway. Only
//! the fields needed to scope exports to an owner are read.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use thiserror::Error;

/// Header carrying the caller identity.
pub const IDENTITY_HEADER: &str = "x-rh-identity";

/// Error type for identity decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity header is not valid base64")]
    InvalidEncoding,
    #[error("identity header is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("identity is missing {0}")]
    MissingField(&'static str),
}

/// Caller identity extracted from the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: String,
    pub org_id: String,
    pub username: String,
    /// The header exactly as received, forwarded to upstream applications.
    pub raw: String,
}

#[derive(Debug, Deserialize)]
struct XRhIdentity {
    identity: IdentityBody,
}

#[derive(Debug, Deserialize)]
struct IdentityBody {
    #[serde(default)]
    account_number: Option<String>,
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    internal: Option<InternalBody>,
    #[serde(default)]
    user: Option<UserBody>,
}

#[derive(Debug, Deserialize)]
struct InternalBody {
    #[serde(default)]
    org_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    #[serde(default)]
    username: Option<String>,
}

/// Decodes an `x-rh-identity` header value.
///
/// `org_id` falls back to `identity.internal.org_id`; the account number may be
/// absent for org-only tenants and decodes to an empty string.
pub fn decode_identity(header: &str) -> Result<Identity, IdentityError> {
    let bytes = STANDARD
        .decode(header.trim())
        .map_err(|_| IdentityError::InvalidEncoding)?;
    let parsed: XRhIdentity =
        serde_json::from_slice(&bytes).map_err(|e| IdentityError::InvalidJson(e.to_string()))?;
    let body = parsed.identity;

    let org_id = body
        .org_id
        .filter(|v| !v.is_empty())
        .or_else(|| body.internal.and_then(|i| i.org_id))
        .filter(|v| !v.is_empty())
        .ok_or(IdentityError::MissingField("org_id"))?;

    let username = body
        .user
        .and_then(|u| u.username)
        .filter(|v| !v.is_empty())
        .ok_or(IdentityError::MissingField("user.username"))?;

    Ok(Identity {
        account_id: body.account_number.unwrap_or_default(),
        org_id,
        username,
        raw: header.trim().to_string(),
    })
}

/// Encodes a minimal identity header. Used by tests and local tooling.
pub fn encode_identity(account_id: &str, org_id: &str, username: &str) -> String {
    let doc = serde_json::json!({
        "identity": {
            "account_number": account_id,
            "org_id": org_id,
            "type": "User",
            "internal": { "org_id": org_id },
            "user": { "username": username }
        }
    });
    STANDARD.encode(doc.to_string())
}
