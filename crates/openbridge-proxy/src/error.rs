//! Proxy error taxonomy and its HTTP rendering.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use openbridge_protocol::openai::ErrorResponse;
use thiserror::Error;

/// Upper bound for backend bodies and stderr quoted in error messages.
pub const MAX_ERROR_DETAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("too many concurrent requests (limit: {capacity}), retry later")]
    CapacityExceeded { capacity: usize },

    #[error("missing backend credential: {0}")]
    MissingCredential(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Backend failure carrying a truncated body or stderr excerpt.
    pub fn backend(context: impl std::fmt::Display, detail: &str) -> Self {
        let detail = truncate_detail(detail.trim());
        if detail.is_empty() {
            ProxyError::Backend(context.to_string())
        } else {
            ProxyError::Backend(format!("{context}: {detail}"))
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::NotFound(_) => "invalid_request_error",
            ProxyError::CapacityExceeded { .. } => "rate_limit_error",
            ProxyError::MissingCredential(_)
            | ProxyError::Backend(_)
            | ProxyError::Timeout { .. }
            | ProxyError::Internal(_) => "server_error",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ProxyError::InvalidRequest(_) => None,
            ProxyError::NotFound(_) => Some("not_found"),
            ProxyError::CapacityExceeded { .. } => Some("capacity_exceeded"),
            ProxyError::MissingCredential(_) => Some("missing_credential"),
            ProxyError::Backend(_) => Some("backend_error"),
            ProxyError::Timeout { .. } => Some("backend_timeout"),
            ProxyError::Internal(_) => None,
        }
    }

    /// The OpenAI error envelope for this error.
    pub fn to_error_response(&self) -> ErrorResponse {
        match self.code() {
            Some(code) => ErrorResponse::with_code(self.to_string(), self.error_type(), code),
            None => ErrorResponse::new(self.to_string(), self.error_type()),
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::MissingCredential(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Backend(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_error_response())
    }
}

/// Truncate to [`MAX_ERROR_DETAIL_BYTES`] on a char boundary.
pub fn truncate_detail(s: &str) -> String {
    if s.len() <= MAX_ERROR_DETAIL_BYTES {
        return s.to_string();
    }
    let mut end = MAX_ERROR_DETAIL_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated {} bytes]", &s[..end], s.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        let cases = [
            (ProxyError::InvalidRequest("x".into()), 400),
            (ProxyError::NotFound("x".into()), 404),
            (ProxyError::CapacityExceeded { capacity: 2 }, 429),
            (ProxyError::MissingCredential("x".into()), 500),
            (ProxyError::Backend("x".into()), 502),
            (ProxyError::Timeout { secs: 5 }, 504),
            (ProxyError::Internal("x".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code().as_u16(), status, "{err:?}");
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_DETAIL_BYTES);
        let out = truncate_detail(&long);
        assert!(out.contains("[truncated"));
        assert!(out.len() < long.len());

        assert_eq!(truncate_detail("short"), "short");
    }

    #[test]
    fn backend_error_includes_detail() {
        let err = ProxyError::backend("API error 500", "  upstream exploded ");
        assert_eq!(err.to_string(), "backend error: API error 500: upstream exploded");

        let envelope = err.to_error_response();
        assert_eq!(envelope.error.code.as_deref(), Some("backend_error"));
        assert_eq!(envelope.error.r#type, "server_error");
    }
}
