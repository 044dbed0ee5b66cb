//! Dedup keys and priming markers.

use sha2::{Digest, Sha256};

use crate::handler::{HandlerError, PRE_CACHE_HEADER, PRE_CACHE_TAG_HEADER, ProxyRequest};

/// Lowercase hex SHA-256 of a request body.
///
/// Two requests with identical bodies share a key whatever their URL, so
/// bodies must discriminate between endpoints when that matters.
pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// A request's priming marker, parsed from its headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeMarker {
    pub priority: i64,
    pub tag: Option<String>,
}

/// Read the priming marker from a request.
///
/// `Ok(None)` means an ordinary request. A marker whose priority is not an
/// integer is rejected rather than silently forwarded.
pub fn prime_marker(request: &ProxyRequest) -> Result<Option<PrimeMarker>, HandlerError> {
    let Some(raw) = request.headers.get(PRE_CACHE_HEADER) else {
        return Ok(None);
    };

    let priority = raw
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            HandlerError::invalid(format!("`{PRE_CACHE_HEADER}` header must be an integer"))
        })?;

    let tag = request
        .header_str(PRE_CACHE_TAG_HEADER)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string);

    Ok(Some(PrimeMarker { priority, tag }))
}
