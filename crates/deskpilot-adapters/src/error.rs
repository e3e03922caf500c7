//! Mapping of client library errors onto `EngineError`

use bollard::errors::Error as DockerError;
use deskpilot_engine::EngineError;

/// Classify a Docker API error by status code.
pub(crate) fn from_docker(err: DockerError) -> EngineError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        DockerError::DockerStreamError { error } => EngineError::BuildFailed(error),
        other => EngineError::Unavailable(other.to_string()),
    }
}

/// Classify a model service HTTP error.
pub(crate) fn from_http(err: reqwest::Error) -> EngineError {
    match err.status() {
        Some(status) if status.as_u16() == 404 => EngineError::NotFound(err.to_string()),
        Some(status) => EngineError::Api {
            status: status.as_u16(),
            message: err.to_string(),
        },
        None if err.is_decode() => EngineError::Malformed(err.to_string()),
        None => EngineError::Unavailable(err.to_string()),
    }
}
