//! Error types for deskpilot-engine

use thiserror::Error;

/// Errors reported by a collaborator (container engine or model service)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Referenced container, image or model does not exist
    #[error("No such object: {0}")]
    NotFound(String),

    /// Operation conflicts with the current object state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Engine or service could not be reached
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Engine answered with an error status
    #[error("Request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    /// Image build reported a failure
    #[error("Build failed: {0}")]
    BuildFailed(String),

    /// Build context could not be assembled
    #[error("Invalid build context: {0}")]
    Context(String),

    /// Response could not be decoded
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl EngineError {
    /// Whether this error means the referenced object is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = EngineError::NotFound("container abc".to_string());
        assert!(err.to_string().contains("No such object"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_api_error_carries_status() {
        let err = EngineError::Api {
            status: 500,
            message: "daemon exploded".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("500"));
        assert!(msg.contains("daemon exploded"));
        assert!(!err.is_not_found());
    }
}
