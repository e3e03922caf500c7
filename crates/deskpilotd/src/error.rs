//! HTTP error mapping for gateway handlers.
//!
//! Every failure body is `{"ok": false, "message": ..}`, with an `error`
//! field carrying the underlying cause for server-side failures.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use deskpilot_core::{BuildError, DownloadError, LifecycleError};
use serde_json::json;

pub const AUTH_REQUIRED_MESSAGE: &str = "Authentication required";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Unavailable(String),
    Internal { message: String, error: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: message.into(),
            error: error.to_string(),
        }
    }

    /// Map a build failure; `context` is the message for server-side errors.
    pub fn build(context: &str, err: BuildError) -> Self {
        match err {
            BuildError::InvalidRecipe(_) => Self::bad_request(err.to_string()),
            BuildError::RecipeNotFound { .. } | BuildError::UnknownBuild(_) => {
                Self::not_found(err.to_string())
            }
            BuildError::ContextUnavailable { .. } | BuildError::Failed { .. } => {
                Self::internal(context, err)
            }
        }
    }

    pub fn lifecycle(context: &str, err: LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidInput(message) => Self::BadRequest(message),
            LifecycleError::NotFound(message) => Self::NotFound(message),
            other => Self::internal(context, other),
        }
    }

    pub fn download(context: &str, err: DownloadError) -> Self {
        match err {
            DownloadError::InvalidName(_) => Self::bad_request(err.to_string()),
            DownloadError::UnknownArtifact(_) => Self::not_found(err.to_string()),
            DownloadError::ServiceUnhealthy => Self::Unavailable(err.to_string()),
            DownloadError::Service(_) => Self::internal(context, err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "ok": false, "message": message }),
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "ok": false, "message": AUTH_REQUIRED_MESSAGE }),
            ),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                json!({ "ok": false, "message": message }),
            ),
            Self::Unavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "ok": false, "message": message }),
            ),
            Self::Internal { message, error } => {
                tracing::error!(message = %message, error = %error, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "ok": false, "message": message, "error": error }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_not_found_keeps_message() {
        let err = ApiError::lifecycle(
            "Failed to stop container",
            LifecycleError::NotFound("No such container: abc".into()),
        );
        assert!(matches!(err, ApiError::NotFound(ref m) if m == "No such container: abc"));
    }

    #[test]
    fn test_start_failure_is_internal_with_cause() {
        let err = ApiError::lifecycle(
            "Failed to start container",
            LifecycleError::StartFailed {
                message: "port is already allocated".into(),
                container_id: None,
            },
        );
        match err {
            ApiError::Internal { message, error } => {
                assert_eq!(message, "Failed to start container");
                assert!(error.contains("port is already allocated"));
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn test_unhealthy_service_is_unavailable() {
        let err = ApiError::download("Failed to pull model", DownloadError::ServiceUnhealthy);
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_recipe_errors_map_to_client_statuses() {
        let invalid = ApiError::build("x", BuildError::InvalidRecipe("../x".into()));
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);

        let missing = ApiError::build(
            "x",
            BuildError::RecipeNotFound {
                recipe: "Dockerfile".into(),
                dir: "/tmp".into(),
            },
        );
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }
}
