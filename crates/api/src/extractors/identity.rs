//! Caller identity extractor.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use domain::models::Owner;
use shared::identity::{decode_identity, Identity, IDENTITY_HEADER};

use crate::error::ApiError;

/// Identity of the caller of a public route.
///
/// Taken from request extensions when the identity middleware already ran,
/// otherwise decoded from the `x-rh-identity` header.
#[derive(Debug, Clone)]
pub struct CallerIdentity(pub Identity);

impl CallerIdentity {
    pub fn owner(&self) -> Owner {
        Owner {
            account_id: self.0.account_id.clone(),
            organization_id: self.0.org_id.clone(),
            username: self.0.username.clone(),
        }
    }

    /// Header value as received, forwarded to upstream applications.
    pub fn raw(&self) -> &str {
        &self.0.raw
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<Identity>() {
            return Ok(Self(identity.clone()));
        }

        let header = parts
            .headers
            .get(IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing x-rh-identity header".into()))?;

        decode_identity(header)
            .map(Self)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))
    }
}
