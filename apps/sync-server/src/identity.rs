//! Caller identity.
//!
//! Authentication happens in front of this service. It forwards the trusted
//! tenant and user as headers, and every store query is scoped by the
//! tenant taken from here.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ServerError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const DEVICE_HEADER: &str = "x-device-id";

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: Option<String>,
}

impl Identity {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Identity {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            device_id: None,
        }
    }
}

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = header(parts, TENANT_HEADER)
            .ok_or_else(|| ServerError::Unauthenticated(format!("{TENANT_HEADER} header")))?;
        let user_id = header(parts, USER_HEADER)
            .ok_or_else(|| ServerError::Unauthenticated(format!("{USER_HEADER} header")))?;

        Ok(Identity {
            tenant_id,
            user_id,
            device_id: header(parts, DEVICE_HEADER),
        })
    }
}
