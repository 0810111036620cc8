use crate::application::{AccessError, AdminGrant};
use axum::http::{header, header::HeaderMap};

pub(super) fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Resolve the caller against the shared admin secret. An empty secret
/// disables the admin surface entirely.
pub(super) fn admin_grant(headers: &HeaderMap, admin_token: &str) -> Result<AdminGrant, AccessError> {
    let is_admin = !admin_token.is_empty()
        && extract_bearer_token(headers)
            .map(|t| constant_time_eq(t.as_bytes(), admin_token.as_bytes()))
            .unwrap_or(false);
    AdminGrant::verify(is_admin)
}
