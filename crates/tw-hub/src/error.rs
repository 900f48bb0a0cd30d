//! # API Errors
//!
//! Every failure leaves the server as `{"error_code": ..., "message": ...}`
//! with the HTTP status its code implies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tw_query::{ErrorKind, QueryError};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidParameterValue,
    BadRequest,
    ResourceDoesNotExist,
    ResourceAlreadyExists,
    InternalError,
    EndpointNotFound,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidParameterValue | Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::ResourceDoesNotExist | Self::EndpointNotFound => StatusCode::NOT_FOUND,
            Self::ResourceAlreadyExists => StatusCode::CONFLICT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.error_code.status(), Json(self)).into_response()
    }
}

/// Failures of search and ingestion, before they are mapped to the wire.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let code = match err.kind() {
            ErrorKind::InvalidPageToken => ErrorCode::BadRequest,
            _ => ErrorCode::InvalidParameterValue,
        };
        tracing::warn!(kind = %err.kind(), "rejected request: {}", err);
        Self::new(code, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::NotFound(_) => ErrorCode::ResourceDoesNotExist,
            StoreError::AlreadyExists(_) => ErrorCode::ResourceAlreadyExists,
            StoreError::InvalidState(_) => ErrorCode::InvalidParameterValue,
            StoreError::Backend { .. } => {
                tracing::error!("{}", err);
                ErrorCode::InternalError
            }
        };
        Self::new(code, err.to_string())
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Query(e) => e.into(),
            HubError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_errors_map_to_parameter_value() {
        let err: ApiError =
            QueryError::invalid(ErrorKind::MalformedFilter, "malformed filter 'x'").into();
        assert_eq!(err.error_code, ErrorCode::InvalidParameterValue);
        assert_eq!(err.error_code.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = QueryError::invalid(ErrorKind::InvalidPageToken, "bad").into();
        assert_eq!(err.error_code, ErrorCode::BadRequest);
    }

    #[test]
    fn test_store_errors() {
        let err: ApiError = StoreError::NotFound("Run with id=x not found".into()).into();
        assert_eq!(err.error_code.status(), StatusCode::NOT_FOUND);
        let err: ApiError = StoreError::AlreadyExists("dup".into()).into();
        assert_eq!(err.error_code.status(), StatusCode::CONFLICT);
        let err: ApiError = StoreError::Backend {
            context: "run abc".into(),
            message: "disk full".into(),
        }
        .into();
        assert_eq!(err.error_code, ErrorCode::InternalError);
        assert_eq!(err.message, "storage failure for run abc: disk full");
    }

    #[test]
    fn test_wire_shape() {
        let body = serde_json::to_value(ApiError::bad_request("no")).unwrap();
        assert_eq!(body, serde_json::json!({"error_code": "BAD_REQUEST", "message": "no"}));
    }
}
