//! Caller identity as forwarded by the TLS-terminating proxy.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::errors::AppError;

pub const USER_DN_HEADER: &str = "USER_DN";
pub const CLIENT_DN_HEADER: &str = "SSL_CLIENT_S_DN";

/// Distinguished name of the user making the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub dn: String,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        [USER_DN_HEADER, CLIENT_DN_HEADER]
            .iter()
            .filter_map(|name| parts.headers.get(*name))
            .filter_map(|value| value.to_str().ok())
            .map(str::trim)
            .find(|dn| !dn.is_empty())
            .map(|dn| Caller { dn: dn.to_string() })
            .ok_or_else(|| AppError::malformed("Cannot determine user from request"))
    }
}
