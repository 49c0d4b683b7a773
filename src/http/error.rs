// src/http/error.rs

//! HTTP mapping of control-plane errors.
//!
//! Client errors carry their message. Internal errors are logged in full and
//! answered with a generic message.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::errors::ServiceError;

#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(ServiceError::InvalidParameters(rejection.body_text()))
    }
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError(ServiceError::InvalidParameters(msg.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            ServiceError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) | ServiceError::ArtifactNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ServiceError::InvalidState { .. } | ServiceError::Conflict { .. } => {
                StatusCode::CONFLICT
            }
            ServiceError::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::StaleTransition { .. } | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "internal error while handling request");
            "internal server error".to_owned()
        } else {
            self.0.to_string()
        };

        let mut response =
            (status, Json(json!({ "error": message, "code": self.0.code() }))).into_response();

        if let ServiceError::Overloaded { retry_after, .. } = &self.0 {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
