//! Crate-wide error kind surfaced to callers of the query layer, the
//! processor, and the ephemeral REST harness.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// A field-level validation failure, carried by [`AppError::InvalidRequest`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The five caller-visible error kinds. Internal errors are never surfaced
/// verbatim — every backend fault is rewrapped as
/// [`AppError::ServiceUnavailable`] with the original error logged.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0:?}")]
    InvalidRequest(Vec<FieldError>),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable")]
    ServiceUnavailable,
}

impl AppError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest(vec![FieldError::new(field, message)])
    }

    /// HTTP status code this error kind maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::InvalidRequest(_) => 400,
            AppError::Unauthorized => 500,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::ServiceUnavailable => 503,
        }
    }
}

/// Rewrap a backend fault as `ServiceUnavailable`, logging the original error
/// against the given request id. Use at every boundary where a library error
/// (ClickHouse, NATS, CEL) would otherwise leak to a caller.
pub fn service_unavailable<E: std::fmt::Display>(request_id: &str, err: E) -> AppError {
    tracing::error!(request_id, error = %err, "backend fault rewrapped as service unavailable");
    AppError::ServiceUnavailable
}

#[derive(serde::Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let fields = match &self {
            AppError::InvalidRequest(f) => f.clone(),
            _ => Vec::new(),
        };
        let body = ErrorBody {
            message: self.to_string(),
            fields,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(AppError::invalid("limit", "must be >= 0").status_code(), 400);
        assert_eq!(AppError::Unauthorized.status_code(), 500);
        assert_eq!(AppError::NotFound("x".into()).status_code(), 404);
        assert_eq!(AppError::Conflict("x".into()).status_code(), 409);
        assert_eq!(AppError::ServiceUnavailable.status_code(), 503);
    }

    #[test]
    fn invalid_carries_field_path() {
        let err = AppError::invalid("spec.filter", "unknown identifier 'foo'");
        match err {
            AppError::InvalidRequest(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field, "spec.filter");
            }
            _ => panic!("expected InvalidRequest"),
        }
    }
}
