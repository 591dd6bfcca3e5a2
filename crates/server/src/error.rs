//! HTTP error mapping.
//!
//! Every handler error becomes `{error, status: "error", details?}` with
//! the status code dictated by the error kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use callbridge_ingest::IngestError;
use callbridge_persistence::PersistenceError;
use callbridge_rag::RagError;
use callbridge_telephony::TelephonyError;

/// API-boundary error.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": "error",
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<PersistenceError> for ApiError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::NotFound(what) => Self::not_found(format!("not found: {what}")),
            PersistenceError::Conflict(what) => Self::conflict(what),
            PersistenceError::InvalidData(what) => Self::bad_request(what),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::FileTooLarge(_) => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
            }
            IngestError::UnsupportedType(_) => Self::bad_request(e.to_string()),
            IngestError::NotFound(what) => Self::not_found(format!("not found: {what}")),
            IngestError::AlreadyTerminal | IngestError::AlreadyPurged => {
                Self::conflict(e.to_string())
            }
            IngestError::Transport(_) => Self::new(StatusCode::BAD_GATEWAY, e.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<TelephonyError> for ApiError {
    fn from(e: TelephonyError) -> Self {
        match e {
            TelephonyError::Validation(what) => Self::bad_request(what),
            TelephonyError::Admission(_) => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, e.to_string())
            }
            TelephonyError::NotFound(what) => Self::not_found(format!("not found: {what}")),
            TelephonyError::ControlPlane(what) => {
                Self::new(StatusCode::BAD_GATEWAY, what)
            }
        }
    }
}

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        match e {
            RagError::Connection(what) | RagError::Embedding(what) => {
                Self::new(StatusCode::BAD_GATEWAY, what)
            }
            other => Self::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_status_codes() {
        let e: ApiError = PersistenceError::Conflict("slug taken".into()).into();
        assert_eq!(e.status, StatusCode::CONFLICT);

        let e: ApiError = IngestError::FileTooLarge(99).into();
        assert_eq!(e.status, StatusCode::PAYLOAD_TOO_LARGE);

        let e: ApiError = TelephonyError::Admission(50).into();
        assert_eq!(e.status, StatusCode::TOO_MANY_REQUESTS);

        let e: ApiError = TelephonyError::Validation("bad phone".into()).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);

        let e: ApiError = IngestError::AlreadyPurged.into();
        assert_eq!(e.status, StatusCode::CONFLICT);
    }
}
