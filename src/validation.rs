//! Boundary checks applied before a request reaches the coordinator.

use crate::error::CounterError;
use crate::types::{ClientId, RequestId};
use uuid::{Uuid, Variant};

/// Longest client id kept after sanitizing.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Validate an idempotency token, generating one when the caller sent none.
///
/// A supplied token must be a hyphenated UUID v4 with the RFC 4122 variant.
pub fn validate_request_id(raw: Option<&str>) -> Result<RequestId, CounterError> {
    let raw = match raw {
        Some(raw) => raw,
        None => return Ok(RequestId::generate()),
    };

    let invalid = || CounterError::Validation("Invalid request ID format".into());

    // Only the 8-4-4-4-12 form; `Uuid::parse_str` also takes braced and simple forms
    if raw.len() != 36 {
        return Err(invalid());
    }

    let uuid = Uuid::parse_str(raw).map_err(|_| invalid())?;
    if uuid.get_version_num() != 4 || uuid.get_variant() != Variant::RFC4122 {
        return Err(invalid());
    }

    Ok(RequestId::new(raw))
}

/// Strip a client id down to `[A-Za-z0-9_-]`, at most 64 characters.
///
/// Missing or empty-after-sanitizing ids become `"anonymous"`.
pub fn sanitize_client_id(raw: Option<&str>) -> ClientId {
    let sanitized: String = raw
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_CLIENT_ID_LEN)
        .collect();

    if sanitized.is_empty() {
        ClientId::anonymous()
    } else {
        ClientId::new(sanitized)
    }
}
