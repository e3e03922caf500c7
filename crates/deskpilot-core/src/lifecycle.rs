//! Container lifecycle management
//!
//! Owns the single container of the configured logical name. Start and
//! delete are serialized behind one async lock and always look the
//! container up by name first, so at most one instance exists.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use deskpilot_engine::{
    ContainerEngine, ContainerInspect, ContainerSpec, EngineError, EngineState, PortProbe,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::build::{BuildError, BuildOrchestrator};
use crate::config::{DeskConfig, DISPLAY_PORT, LOCAL_IMAGE_TAG, PROXY_PORT, SERVICE_PORTS};
use crate::obs;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The engine refused to create or start the container. `container_id`
    /// is set when the container exists but did not start.
    #[error("failed to start container: {message}")]
    StartFailed {
        message: String,
        container_id: Option<String>,
    },

    #[error("local image build failed: {0}")]
    Build(#[from] BuildError),

    #[error("{0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("container engine error: {0}")]
    Engine(#[from] EngineError),
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Absent,
    Created,
    Running,
    Exited,
    Error,
}

/// Mapped container state with human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub status: ContainerState,
    pub detail: String,
}

impl ContainerStatus {
    pub fn absent() -> Self {
        ContainerStatus {
            status: ContainerState::Absent,
            detail: String::new(),
        }
    }

    /// Map a raw engine inspection onto the five-state model.
    pub fn from_inspect(inspect: &ContainerInspect) -> Self {
        let (status, detail) = match inspect.state {
            EngineState::Created => (ContainerState::Created, String::new()),
            EngineState::Running => (
                ContainerState::Running,
                format!(
                    "Started at: {}\nPID: {}",
                    inspect.started_at.as_deref().unwrap_or_default(),
                    inspect.pid.map(|p| p.to_string()).unwrap_or_default(),
                ),
            ),
            EngineState::Exited => (
                ContainerState::Exited,
                format!(
                    "Exit code: {}\nError: {}\nFinished at: {}",
                    inspect
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_default(),
                    inspect.error.as_deref().unwrap_or("None"),
                    inspect.finished_at.as_deref().unwrap_or_default(),
                ),
            ),
            ref other => (ContainerState::Error, format!("Engine state: {other}")),
        };
        ContainerStatus { status, detail }
    }
}

/// One tick of a container status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: ContainerState,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl From<ContainerStatus> for StatusEvent {
    fn from(s: ContainerStatus) -> Self {
        StatusEvent {
            status: s.status,
            detail: s.detail,
            timestamp: Utc::now(),
        }
    }
}

/// Result of [`LifecycleManager::delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { id: String },
    NotFound,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    builds: Arc<BuildOrchestrator>,
    probe: Arc<dyn PortProbe>,
    container_name: String,
    probe_host: String,
    env: Vec<String>,
    lock: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        builds: Arc<BuildOrchestrator>,
        probe: Arc<dyn PortProbe>,
        config: &DeskConfig,
    ) -> Self {
        LifecycleManager {
            engine,
            builds,
            probe,
            container_name: config.container_name.clone(),
            probe_host: config.probe_host.clone(),
            env: config.container_env(),
            lock: Mutex::new(()),
        }
    }

    /// Ensure the managed container is running and return its id.
    ///
    /// With `is_local_recipe`, `image` names a recipe that is built into
    /// the local image tag first; the build must succeed.
    pub async fn start(&self, image: &str, is_local_recipe: bool) -> LifecycleResult<String> {
        if image.trim().is_empty() {
            return Err(LifecycleError::InvalidInput("Image name is required".to_string()));
        }
        let _guard = self.lock.lock().await;

        let image = if is_local_recipe {
            let outcome = self.builds.build(image, LOCAL_IMAGE_TAG).await?;
            debug!(build_id = %outcome.build_id, "local image ready");
            LOCAL_IMAGE_TAG.to_string()
        } else {
            image.to_string()
        };

        let existing = self
            .engine
            .find_by_name(&self.container_name)
            .await
            .map_err(|e| start_failed(e, None))?;

        if let Some(found) = existing {
            if found.state == EngineState::Running {
                debug!(container_id = %found.id, "container already running");
                return Ok(found.id);
            }
            self.engine
                .start_container(&found.id)
                .await
                .map_err(|e| start_failed(e, Some(&found.id)))?;
            obs::emit_container_started(&found.id, &image, false);
            return Ok(found.id);
        }

        let spec = ContainerSpec {
            name: self.container_name.clone(),
            image: image.clone(),
            ports: SERVICE_PORTS.to_vec(),
            env: self.env.clone(),
        };
        let id = self
            .engine
            .create_container(&spec)
            .await
            .map_err(|e| start_failed(e, None))?;
        self.engine
            .start_container(&id)
            .await
            .map_err(|e| start_failed(e, Some(&id)))?;

        obs::emit_container_started(&id, &image, true);
        Ok(id)
    }

    /// Stop a container. Already stopped is success.
    pub async fn stop(&self, id: &str) -> LifecycleResult<()> {
        if id.trim().is_empty() {
            return Err(LifecycleError::InvalidInput("Container ID is required".to_string()));
        }
        match self.engine.stop_container(id).await {
            Ok(()) => {
                obs::emit_container_stopped(id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Err(LifecycleError::NotFound(format!(
                "No such container: {id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the managed container, stopping it first when running.
    pub async fn delete(&self) -> LifecycleResult<DeleteOutcome> {
        let _guard = self.lock.lock().await;

        let Some(found) = self.engine.find_by_name(&self.container_name).await? else {
            info!(name = %self.container_name, "no container to delete");
            return Ok(DeleteOutcome::NotFound);
        };

        if found.state == EngineState::Running {
            self.engine.stop_container(&found.id).await?;
            obs::emit_container_stopped(&found.id);
        }
        match self.engine.remove_container(&found.id).await {
            Ok(()) => {}
            // Removed concurrently outside this process.
            Err(e) if e.is_not_found() => return Ok(DeleteOutcome::NotFound),
            Err(e) => return Err(e.into()),
        }

        obs::emit_container_deleted(&found.id);
        Ok(DeleteOutcome::Deleted { id: found.id })
    }

    /// Current mapped state of `id`; a missing container is `absent`.
    pub async fn inspect_status(&self, id: &str) -> LifecycleResult<ContainerStatus> {
        match self.engine.inspect_container(id).await {
            Ok(inspect) => Ok(ContainerStatus::from_inspect(&inspect)),
            Err(e) if e.is_not_found() => Ok(ContainerStatus::absent()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the display and proxy ports of a running container accept
    /// connections. Never fails.
    pub async fn check_readiness(&self, id: &str) -> bool {
        let running = matches!(
            self.engine.inspect_container(id).await,
            Ok(ContainerInspect {
                state: EngineState::Running,
                ..
            })
        );
        if !running {
            return false;
        }

        let (display_open, proxy_open) = tokio::join!(
            self.probe.is_open(&self.probe_host, DISPLAY_PORT),
            self.probe.is_open(&self.probe_host, PROXY_PORT),
        );
        debug!(
            container_id = %id,
            display = display_open,
            proxy = proxy_open,
            "readiness probed"
        );
        display_open && proxy_open
    }

    /// Run a shell command in the managed container and return its output.
    pub async fn execute_command(&self, command: &str) -> LifecycleResult<String> {
        if command.trim().is_empty() {
            return Err(LifecycleError::InvalidInput("Command is required".to_string()));
        }
        let found = self
            .engine
            .find_by_name(&self.container_name)
            .await?
            .ok_or_else(|| LifecycleError::NotFound("No container found".to_string()))?;

        Ok(self.engine.exec(&found.id, command).await?)
    }
}

fn start_failed(err: EngineError, container_id: Option<&str>) -> LifecycleError {
    obs::emit_collaborator_error("start_container", &err);
    LifecycleError::StartFailed {
        message: err.to_string(),
        container_id: container_id.map(str::to_string),
    }
}
