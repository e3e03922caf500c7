//! Container engine contract
//!
//! The orchestrator only needs a handful of engine operations. They are
//! expressed here in engine-neutral terms so the rest of the workspace never
//! sees a Docker type.
//!
//! Build progress is delivered over a bounded `mpsc` channel owned by the
//! caller instead of a callback: the engine pushes records while the build
//! runs and reports the terminal outcome through its return value.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::EngineResult;

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Everything an engine needs to build one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Directory holding the build context
    pub context_dir: PathBuf,
    /// File names (relative to `context_dir`) that make up the context
    pub files: Vec<String>,
    /// Recipe file inside the context
    pub dockerfile: String,
    /// Target image tag
    pub tag: String,
    /// Build arguments
    pub build_args: BTreeMap<String, String>,
    /// Disable the layer cache
    pub no_cache: bool,
    /// Always attempt to pull a newer base image
    pub pull: bool,
}

impl BuildRequest {
    /// Cached build of `dockerfile` from `context_dir` tagged as `tag`.
    pub fn cached(
        context_dir: impl Into<PathBuf>,
        files: Vec<String>,
        dockerfile: &str,
        tag: &str,
    ) -> Self {
        let mut build_args = BTreeMap::new();
        build_args.insert("BUILDKIT_INLINE_CACHE".to_string(), "1".to_string());
        BuildRequest {
            context_dir: context_dir.into(),
            files,
            dockerfile: dockerfile.to_string(),
            tag: tag.to_string(),
            build_args,
            no_cache: false,
            pull: true,
        }
    }
}

/// One raw progress record emitted by the engine while building.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProgress {
    /// Log output line
    pub stream: Option<String>,
    /// Status line (layer pulls etc.)
    pub status: Option<String>,
}

impl BuildProgress {
    pub fn stream(line: impl Into<String>) -> Self {
        BuildProgress {
            stream: Some(line.into()),
            status: None,
        }
    }

    pub fn status(line: impl Into<String>) -> Self {
        BuildProgress {
            stream: None,
            status: Some(line.into()),
        }
    }

    /// The raw text carried by this record: `stream`, else `status`, else empty.
    pub fn line(&self) -> String {
        self.stream
            .as_deref()
            .or(self.status.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// Raw engine container state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl EngineState {
    /// Parse the engine's lowercase status string.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => EngineState::Created,
            "running" => EngineState::Running,
            "paused" => EngineState::Paused,
            "restarting" => EngineState::Restarting,
            "removing" => EngineState::Removing,
            "exited" => EngineState::Exited,
            "dead" => EngineState::Dead,
            _ => EngineState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "created",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Restarting => "restarting",
            EngineState::Removing => "removing",
            EngineState::Exited => "exited",
            EngineState::Dead => "dead",
            EngineState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry returned by a name lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: EngineState,
}

/// Result of inspecting one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub id: String,
    pub state: EngineState,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub pid: Option<i64>,
}

/// Creation parameters for the managed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Logical container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// TCP ports exposed and bound 1:1 on the host
    pub ports: Vec<u16>,
    /// `KEY=VALUE` environment entries
    pub env: Vec<String>,
}

/// Container engine operations consumed by the orchestrator.
///
/// Guarantees expected from implementations:
/// - `stop_container` on an already stopped container succeeds.
/// - Operations on an unknown id fail with `EngineError::NotFound`.
/// - `build_image` sends zero or more progress records, then returns
///   `Ok(())` on success or the engine's error on failure. It never sends
///   after returning.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build an image, streaming raw progress into `progress`.
    async fn build_image(
        &self,
        request: BuildRequest,
        progress: mpsc::Sender<BuildProgress>,
    ) -> EngineResult<()>;

    /// Look up a container (any state) by its exact name.
    async fn find_by_name(&self, name: &str) -> EngineResult<Option<ContainerSummary>>;

    /// Create (but do not start) a container. Returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    async fn stop_container(&self, id: &str) -> EngineResult<()>;

    async fn remove_container(&self, id: &str) -> EngineResult<()>;

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspect>;

    /// Run a shell command inside a running container and return its output.
    async fn exec(&self, id: &str, command: &str) -> EngineResult<String>;
}
