//! API error handling.
//!
//! Every error body is `{"error": "<message>"}`; the message is already in
//! user vocabulary by the time it gets here.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::Error;

/// API error type that renders as an HTTP status + JSON body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message)
    }

    /// The standard per-client cap rejection.
    pub fn client_cap() -> Self {
        Self::too_many_requests(format!(
            "Too many active jobs. Maximum {} concurrent jobs per user.",
            crate::config::MAX_JOBS_PER_CLIENT
        ))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Validation(msg) => ApiError::bad_request(msg.clone()),
            Error::Admission(msg) => ApiError::service_unavailable(msg.clone()),
            Error::Timeout(msg) => ApiError::gateway_timeout(msg.clone()),
            Error::Cancelled => ApiError::bad_request(err.user_message()),
            Error::Encoding(_) => ApiError::internal(err.user_message()),
            Error::Io(e) => {
                tracing::error!(error = %e, "IO error");
                ApiError::internal("An unexpected error occurred")
            }
            _ => ApiError::internal(err.user_message()),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_cap_names_the_limit() {
        let err = ApiError::client_cap();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(err.message.contains("Maximum 5"));
    }

    #[test]
    fn upstream_errors_fold_to_user_vocabulary() {
        let api: ApiError = Error::Upstream("HTTP Error 404: Not Found".into()).into();
        assert_eq!(api.message, "Video not found, it may have been deleted");
    }

    #[test]
    fn admission_maps_to_503() {
        let api: ApiError = Error::Admission("Too many active download jobs (limit: 6)".into()).into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(api.message.contains("limit: 6"));
    }

    #[test]
    fn timeout_maps_to_504() {
        let api: ApiError = Error::Timeout("Metadata fetch timed out (30s)".into()).into();
        assert_eq!(api.status, StatusCode::GATEWAY_TIMEOUT);
    }
}
