//! Model service contract (Ollama-compatible)

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::EngineResult;

/// A model already present in the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledModel {
    pub name: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: String,
}

impl InstalledModel {
    pub fn named(name: &str) -> Self {
        InstalledModel {
            name: name.to_string(),
            digest: String::new(),
            size: 0,
            modified_at: String::new(),
        }
    }
}

/// One record of a pull progress feed.
///
/// Matches the newline-delimited JSON emitted by `POST /api/pull`:
/// `{"status":"pulling manifest"}`, `{"status":"downloading","total":..,"completed":..}`,
/// `{"status":"success"}` or `{"error":".."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullProgress {
    pub fn status(status: &str) -> Self {
        PullProgress {
            status: status.to_string(),
            ..Default::default()
        }
    }

    pub fn downloading(completed: u64, total: u64) -> Self {
        PullProgress {
            status: "downloading".to_string(),
            total: Some(total),
            completed: Some(completed),
            ..Default::default()
        }
    }

    pub fn success() -> Self {
        Self::status("success")
    }

    pub fn failed(message: &str) -> Self {
        PullProgress {
            error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Rounded percentage when both byte counts are known and `total > 0`.
    pub fn percent(&self) -> Option<u8> {
        match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => {
                let pct = (done as f64 / total as f64 * 100.0).round();
                Some(pct.clamp(0.0, 100.0) as u8)
            }
            _ => None,
        }
    }
}

/// Progress feed returned by [`ModelService::pull`].
pub type PullStream = BoxStream<'static, EngineResult<PullProgress>>;

/// Backing model service.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Liveness probe. Failure is `false`, never an error.
    async fn health(&self) -> bool;

    /// Models currently installed.
    async fn list_installed(&self) -> EngineResult<Vec<InstalledModel>>;

    /// Open a single long-lived pull feed for `name`.
    async fn pull(&self, name: &str) -> EngineResult<PullStream>;
}
