//! Docker engine adapter
//!
//! Talks to the local Docker daemon through `bollard`. The connection is
//! created on first use and cached, so the daemon process can start (and
//! serve model routes) while Docker itself is still coming up.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use deskpilot_engine::{
    BuildProgress, BuildRequest, ContainerEngine, ContainerInspect, ContainerSpec,
    ContainerSummary, EngineError, EngineResult, EngineState,
};
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::from_docker;

/// Grace period handed to the daemon before it kills the container.
const STOP_GRACE_SECS: i64 = 10;

/// `ContainerEngine` backed by the local Docker daemon.
#[derive(Clone, Default)]
pub struct DockerEngine {
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the daemon connection.
    async fn docker(&self) -> EngineResult<Docker> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(format!("docker connect: {e}")))?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }
}

/// Pack `files` from `dir` into an uncompressed tar archive.
///
/// Directories are added recursively. A missing entry is a context error.
pub fn pack_context(dir: &Path, files: &[String]) -> EngineResult<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    for name in files {
        let path = dir.join(name);
        let added = if path.is_dir() {
            archive.append_dir_all(name, &path)
        } else {
            archive.append_path_with_name(&path, name)
        };
        added.map_err(|e| EngineError::Context(format!("{}: {e}", path.display())))?;
    }
    archive
        .into_inner()
        .map_err(|e| EngineError::Context(e.to_string()))
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(
        &self,
        request: BuildRequest,
        progress: mpsc::Sender<BuildProgress>,
    ) -> EngineResult<()> {
        let docker = self.docker().await?;

        let dir = request.context_dir.clone();
        let files = request.files.clone();
        let context = tokio::task::spawn_blocking(move || pack_context(&dir, &files))
            .await
            .map_err(|e| EngineError::Context(e.to_string()))??;
        debug!(tag = %request.tag, bytes = context.len(), "build context packed");

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: request.tag.clone(),
            nocache: request.no_cache,
            pull: request.pull,
            rm: true,
            buildargs: request.build_args.clone().into_iter().collect(),
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(Bytes::from(context)));
        let mut relaying = true;
        while let Some(item) = stream.next().await {
            let info = item.map_err(from_docker)?;
            if let Some(error) = info.error {
                return Err(EngineError::BuildFailed(error));
            }
            if !relaying {
                continue;
            }
            let record = BuildProgress {
                stream: info.stream,
                status: info.status,
            };
            if progress.send(record).await.is_err() {
                // Receiver gone; keep driving the build to completion.
                relaying = false;
            }
        }

        info!(tag = %request.tag, "image built");
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> EngineResult<Option<ContainerSummary>> {
        let docker = self.docker().await?;
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let listed = docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(from_docker)?;

        // The name filter matches substrings; require an exact name.
        let wanted = format!("/{name}");
        let found = listed.into_iter().find(|c| {
            c.names
                .as_ref()
                .is_some_and(|names| names.iter().any(|n| n == &wanted || n == name))
        });

        Ok(found.and_then(|c| {
            Some(ContainerSummary {
                id: c.id?,
                name: name.to_string(),
                state: EngineState::parse(c.state.as_deref().unwrap_or_default()),
            })
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let docker = self.docker().await?;

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(from_docker)?;

        for warning in &created.warnings {
            warn!(container = %spec.name, warning = %warning, "create warning");
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let docker = self.docker().await?;
        match docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(from_docker(e)),
        }
    }

    async fn stop_container(&self, id: &str) -> EngineResult<()> {
        let docker = self.docker().await?;
        match docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(from_docker(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        let docker = self.docker().await?;
        docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(from_docker)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspect> {
        let docker = self.docker().await?;
        let info = docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(from_docker)?;

        let state = info.state.unwrap_or_default();
        let raw = state.status.map(|s| s.to_string()).unwrap_or_default();

        Ok(ContainerInspect {
            id: info.id.unwrap_or_else(|| id.to_string()),
            state: EngineState::parse(&raw),
            exit_code: state.exit_code,
            error: state.error.filter(|e| !e.is_empty()),
            started_at: state.started_at,
            finished_at: state.finished_at,
            pid: state.pid,
        })
    }

    async fn exec(&self, id: &str, command: &str) -> EngineResult<String> {
        let docker = self.docker().await?;
        let exec = docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        command.to_string(),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(from_docker)?;

        match docker.start_exec(&exec.id, None).await.map_err(from_docker)? {
            StartExecResults::Attached { mut output, .. } => {
                let mut collected = String::new();
                while let Some(chunk) = output.next().await {
                    collected.push_str(&chunk.map_err(from_docker)?.to_string());
                }
                Ok(collected)
            }
            StartExecResults::Detached => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_context_includes_listed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile.test"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join("entrypoint.sh"), "#!/bin/sh\n").unwrap();

        let bytes = pack_context(
            dir.path(),
            &["Dockerfile.test".to_string(), "entrypoint.sh".to_string()],
        )
        .unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Dockerfile.test", "entrypoint.sh"]);
    }

    #[test]
    fn test_pack_context_missing_file_is_context_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = pack_context(dir.path(), &["Dockerfile".to_string()]).unwrap_err();
        assert!(matches!(err, EngineError::Context(_)));
    }
}
