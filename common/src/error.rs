use serde_json::{json, Value};
use thiserror::Error;

use crate::card::CardError;

/// Closed error taxonomy of the registry API. Components map their internal
/// errors into this set at the service boundary; HTTP translation happens
/// once, in the server layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid agent card")]
    InvalidCard(Vec<CardError>),
    #[error("authentication required")]
    Unauthenticated(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    // Covers both absent entities and entities invisible to the caller,
    // so existence never leaks across tenants.
    #[error("not found")]
    NotFound,
    #[error("invalid cursor")]
    InvalidCursor,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("temporarily overloaded: {0}")]
    Overloaded(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCard(_) => "invalid_card",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound => "not_found",
            Self::InvalidCursor => "invalid_cursor",
            Self::BadRequest(_) => "bad_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Overloaded(_) => "overloaded",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Upstream(_) => "upstream",
            Self::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidCard(_) => 422,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound => 404,
            Self::InvalidCursor | Self::BadRequest(_) => 400,
            Self::RateLimited { .. } => 429,
            Self::Overloaded(_) | Self::Upstream(_) => 503,
            Self::DeadlineExceeded => 504,
            Self::Internal(_) => 500,
        }
    }

    /// Error envelope returned to clients. `detail` never contains stack
    /// traces or internal identifiers beyond the request id.
    pub fn to_body(&self, request_id: &str) -> Value {
        let detail = match self {
            Self::InvalidCard(errors) => json!(errors),
            Self::RateLimited { retry_after_secs } => {
                json!({ "retryAfterSecs": retry_after_secs })
            }
            // Internal and upstream details stay in the logs
            Self::Internal(_) | Self::Upstream(_) => Value::Null,
            other => Value::String(other.to_string()),
        };
        json!({
            "error": self.to_string(),
            "code": self.code(),
            "detail": detail,
            "requestId": request_id,
        })
    }
}

#[cfg(feature = "rpc-server")]
mod http {
    use actix_web::http::StatusCode;
    use actix_web::{HttpResponse, ResponseError};
    use log::warn;
    use rand::Rng;

    use super::ApiError;

    fn new_request_id() -> String {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        hex::encode(bytes)
    }

    impl ResponseError for ApiError {
        fn status_code(&self) -> StatusCode {
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }

        fn error_response(&self) -> HttpResponse {
            let request_id = new_request_id();
            match self {
                ApiError::Internal(detail) | ApiError::Upstream(detail) => {
                    warn!("request {} failed: {} ({})", request_id, self, detail);
                }
                _ => {
                    if log::log_enabled!(log::Level::Debug) {
                        log::debug!("request {} rejected: {}", request_id, self);
                    }
                }
            }

            let mut builder = HttpResponse::build(self.status_code());
            if let ApiError::RateLimited { retry_after_secs } = self {
                builder.insert_header((
                    crate::config::HEADER_RETRY_AFTER,
                    retry_after_secs.to_string(),
                ));
            }
            builder.insert_header((crate::config::HEADER_REQUEST_ID, request_id.as_str()));
            builder.json(self.to_body(&request_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(ApiError::NotFound.http_status(), 404);
        assert_eq!(ApiError::InvalidCard(Vec::new()).http_status(), 422);
        assert_eq!(
            ApiError::RateLimited {
                retry_after_secs: 3
            }
            .http_status(),
            429
        );
        assert_eq!(ApiError::DeadlineExceeded.http_status(), 504);
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let body = ApiError::Internal("sled io error at /var/db".to_string()).to_body("req-1");
        assert_eq!(body["detail"], Value::Null);
        assert_eq!(body["requestId"], "req-1");
    }
}
