use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::captcha::CaptchaError;
use crate::store::{CryptoError, StoreError};

/// Everything a create or read can end in besides success.
///
/// All variants except `Internal` are ordinary outcomes and carry a message
/// safe to show the client. `Internal` keeps its cause for the log only.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Invalid captcha")]
    CaptchaFailed,
    #[error("Secret not found")]
    NotFound,
    #[error("Secret has expired")]
    Expired,
    #[error("custom name {0:?} is already taken")]
    NameConflict(String),
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::CaptchaFailed => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Expired => StatusCode::GONE,
            Self::NameConflict(_) => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Internal(cause) => {
                tracing::error!(error = %cause, "internal error");
                "internal server error".to_owned()
            }
            other => other.to_string(),
        };
        (self.status(), Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NameTaken(name) => Self::NameConflict(name),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for ServiceError {
    fn from(e: CryptoError) -> Self {
        Self::Internal(format!("server envelope: {e}"))
    }
}

impl From<CaptchaError> for ServiceError {
    fn from(e: CaptchaError) -> Self {
        Self::Internal(format!("captcha verification: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ServiceError::invalid("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::CaptchaFailed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ServiceError::Expired.status(), StatusCode::GONE);
        assert_eq!(ServiceError::NameConflict("n".into()).status(), StatusCode::CONFLICT);
        assert_eq!(ServiceError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ServiceError::Internal("disk on fire".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak_cause() {
        let resp = ServiceError::Internal("/var/lib/secret path".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "error": "internal server error" }));
    }

    #[test]
    fn name_taken_becomes_conflict() {
        let e: ServiceError = StoreError::NameTaken("dup".into()).into();
        assert!(matches!(e, ServiceError::NameConflict(n) if n == "dup"));
    }
}
