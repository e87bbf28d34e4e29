//! Opaque `continue` pagination cursor.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("continue token is malformed")]
    Malformed,
    #[error("continue token no longer matches the query spec; the query changed since this page was issued")]
    SignatureMismatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub tie_breaker: String,
}

/// A stable hash over the query spec excluding `limit` and `continue`.
/// Callers build `spec_fingerprint_source` by serializing every other
/// field in a fixed order.
pub fn sign(spec_fingerprint_source: &str, cursor: &Cursor) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(spec_fingerprint_source.as_bytes());
    hasher.update(cursor.timestamp.to_rfc3339().as_bytes());
    hasher.update(cursor.tie_breaker.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Encode `(timestamp, tie_breaker, signature)` as an opaque token.
pub fn encode(spec_fingerprint_source: &str, cursor: &Cursor) -> String {
    let sig = sign(spec_fingerprint_source, cursor);
    let raw = format!("{}\n{}\n{}", cursor.timestamp.to_rfc3339(), cursor.tie_breaker, sig);
    URL_SAFE_NO_PAD.encode(raw)
}

/// Decode and verify a `continue` token against the current query spec's
/// fingerprint. A signature mismatch means the spec changed between pages.
pub fn decode(token: &str, spec_fingerprint_source: &str) -> Result<Cursor, CursorError> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| CursorError::Malformed)?;
    let raw = String::from_utf8(raw).map_err(|_| CursorError::Malformed)?;
    let mut parts = raw.splitn(3, '\n');
    let (ts, tb, sig) = match (parts.next(), parts.next(), parts.next()) {
        (Some(ts), Some(tb), Some(sig)) => (ts, tb, sig),
        _ => return Err(CursorError::Malformed),
    };
    let timestamp = DateTime::parse_from_rfc3339(ts)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| CursorError::Malformed)?;
    let cursor = Cursor {
        timestamp,
        tie_breaker: tb.to_string(),
    };
    let expected = sign(spec_fingerprint_source, &cursor);
    if expected != sig {
        return Err(CursorError::SignatureMismatch);
    }
    Ok(cursor)
}
