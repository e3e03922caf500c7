//! In-memory fakes for collaborator traits (testing only)
//!
//! Provides `MemoryEngine`, `MemoryModelService`, and `StaticProbe` that
//! satisfy the trait contracts without Docker, Ollama or open sockets.
//! Each fake can be scripted to fail or stall so orchestration edge cases
//! are reachable from plain `#[tokio::test]`s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::container::*;
use crate::error::EngineError;
use crate::model::*;
use crate::probe::PortProbe;
use crate::EngineResult;

// ---------------------------------------------------------------------------
// MemoryEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    state: EngineState,
    exit_code: Option<i64>,
    started_at: Option<String>,
    finished_at: Option<String>,
    pid: Option<i64>,
}

impl FakeContainer {
    fn inspect(&self) -> ContainerInspect {
        ContainerInspect {
            id: self.id.clone(),
            state: self.state.clone(),
            exit_code: self.exit_code,
            error: None,
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
            pid: self.pid,
        }
    }
}

#[derive(Debug, Default)]
struct EngineInner {
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    images: HashSet<String>,
    build_lines: Vec<BuildProgress>,
    build_failure: Option<String>,
    build_delay: Duration,
    builds: usize,
    fail_next_start: Option<String>,
    inspect_failure: Option<EngineError>,
    created: Vec<ContainerSpec>,
    exec_output: String,
    executed: Vec<String>,
}

/// In-memory container engine backed by a `HashMap<id, container>`.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    inner: Mutex<EngineInner>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress records every build emits before finishing.
    pub fn with_build_lines(self, lines: Vec<BuildProgress>) -> Self {
        self.inner.lock().unwrap().build_lines = lines;
        self
    }

    /// Pause between build progress records.
    pub fn with_build_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().build_delay = delay;
        self
    }

    /// Change the per-line delay for builds started from now on.
    pub fn set_build_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().build_delay = delay;
    }

    /// Make every subsequent build fail with `message`.
    pub fn fail_builds(&self, message: &str) {
        self.inner.lock().unwrap().build_failure = Some(message.to_string());
    }

    /// Make the next `start_container` call fail with `message`.
    pub fn fail_next_start(&self, message: &str) {
        self.inner.lock().unwrap().fail_next_start = Some(message.to_string());
    }

    /// Make `inspect_container` fail until cleared with `None`.
    pub fn fail_inspect(&self, err: Option<EngineError>) {
        self.inner.lock().unwrap().inspect_failure = err;
    }

    pub fn set_exec_output(&self, output: &str) {
        self.inner.lock().unwrap().exec_output = output.to_string();
    }

    /// Seed a container directly, bypassing create. Returns its id.
    pub fn insert_container(&self, name: &str, state: EngineState) -> String {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::allocate_id(&mut inner);
        let running = state == EngineState::Running;
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                state,
                exit_code: None,
                started_at: running.then(|| Utc::now().to_rfc3339()),
                finished_at: None,
                pid: running.then_some(4242),
            },
        );
        id
    }

    /// Simulate the container process exiting on its own.
    pub fn exit_container(&self, id: &str, code: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.containers.get_mut(id) {
            c.state = EngineState::Exited;
            c.exit_code = Some(code);
            c.finished_at = Some(Utc::now().to_rfc3339());
            c.pid = Some(0);
        }
    }

    /// Force a raw engine state (e.g. `Paused`, `Dead`).
    pub fn set_state(&self, id: &str, state: EngineState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.containers.get_mut(id) {
            c.state = state;
        }
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }

    pub fn build_count(&self) -> usize {
        self.inner.lock().unwrap().builds
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.inner.lock().unwrap().images.contains(tag)
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn executed_commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().executed.clone()
    }

    pub fn state_of(&self, id: &str) -> Option<EngineState> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.state.clone())
    }

    fn allocate_id(inner: &mut EngineInner) -> String {
        inner.next_id += 1;
        format!("c{:011x}", inner.next_id)
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn build_image(
        &self,
        request: BuildRequest,
        progress: mpsc::Sender<BuildProgress>,
    ) -> EngineResult<()> {
        let (lines, delay, failure) = {
            let mut inner = self.inner.lock().unwrap();
            inner.builds += 1;
            (
                inner.build_lines.clone(),
                inner.build_delay,
                inner.build_failure.clone(),
            )
        };

        for line in lines {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if progress.send(line).await.is_err() {
                break;
            }
        }

        if let Some(message) = failure {
            return Err(EngineError::BuildFailed(message));
        }
        self.inner.lock().unwrap().images.insert(request.tag);
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> EngineResult<Option<ContainerSummary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                state: c.state.clone(),
            }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Conflict(format!(
                "container name {} is already in use",
                spec.name
            )));
        }
        let id = Self::allocate_id(&mut inner);
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                state: EngineState::Created,
                exit_code: None,
                started_at: None,
                finished_at: None,
                pid: None,
            },
        );
        inner.created.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.fail_next_start.take() {
            return Err(EngineError::Api {
                status: 500,
                message,
            });
        }
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))?;
        c.state = EngineState::Running;
        c.started_at = Some(Utc::now().to_rfc3339());
        c.finished_at = None;
        c.exit_code = None;
        c.pid = Some(4242);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))?;
        if c.state == EngineState::Running {
            c.state = EngineState::Exited;
            c.exit_code = Some(0);
            c.finished_at = Some(Utc::now().to_rfc3339());
            c.pid = Some(0);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get(id) {
            None => Err(EngineError::NotFound(format!("container {id}"))),
            Some(c) if c.state == EngineState::Running => Err(EngineError::Conflict(format!(
                "cannot remove running container {id}"
            ))),
            Some(_) => {
                inner.containers.remove(id);
                Ok(())
            }
        }
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspect> {
        let inner = self.inner.lock().unwrap();
        if let Some(err) = &inner.inspect_failure {
            return Err(err.clone());
        }
        inner
            .containers
            .get(id)
            .map(FakeContainer::inspect)
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))
    }

    async fn exec(&self, id: &str, command: &str) -> EngineResult<String> {
        let mut inner = self.inner.lock().unwrap();
        let running = match inner.containers.get(id) {
            None => return Err(EngineError::NotFound(format!("container {id}"))),
            Some(c) => c.state == EngineState::Running,
        };
        if !running {
            return Err(EngineError::Conflict(format!(
                "container {id} is not running"
            )));
        }
        inner.executed.push(command.to_string());
        Ok(inner.exec_output.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryModelService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PullScript {
    items: Vec<EngineResult<PullProgress>>,
    hold_open: bool,
}

impl Default for PullScript {
    fn default() -> Self {
        PullScript {
            items: vec![
                Ok(PullProgress::status("pulling manifest")),
                Ok(PullProgress::downloading(0, 100)),
                Ok(PullProgress::downloading(50, 100)),
                Ok(PullProgress::downloading(100, 100)),
                Ok(PullProgress::success()),
            ],
            hold_open: false,
        }
    }
}

#[derive(Debug)]
struct ModelInner {
    healthy: bool,
    installed: Vec<InstalledModel>,
    scripts: HashMap<String, PullScript>,
    step_delay: Duration,
    pull_counts: HashMap<String, usize>,
    open_failure: Option<EngineError>,
}

impl Default for ModelInner {
    fn default() -> Self {
        ModelInner {
            healthy: true,
            installed: Vec::new(),
            scripts: HashMap::new(),
            step_delay: Duration::ZERO,
            pull_counts: HashMap::new(),
            open_failure: None,
        }
    }
}

/// In-memory model service with scriptable pull feeds.
///
/// Without a script, a pull emits a short manifest/download/success sequence.
/// A successful pull adds the model to the installed list.
#[derive(Debug, Clone, Default)]
pub struct MemoryModelService {
    inner: Arc<Mutex<ModelInner>>,
}

impl MemoryModelService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_installed(self, names: &[&str]) -> Self {
        self.inner.lock().unwrap().installed = names.iter().map(|n| InstalledModel::named(n)).collect();
        self
    }

    /// Pause before every pull record.
    pub fn with_step_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().step_delay = delay;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.lock().unwrap().healthy = healthy;
    }

    /// Replace the feed for `name`. With `hold_open`, the stream stays
    /// pending after the scripted items instead of ending.
    pub fn script_pull(&self, name: &str, items: Vec<EngineResult<PullProgress>>, hold_open: bool) {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(name.to_string(), PullScript { items, hold_open });
    }

    /// Make opening any pull feed fail until cleared with `None`.
    pub fn fail_pull_open(&self, err: Option<EngineError>) {
        self.inner.lock().unwrap().open_failure = err;
    }

    pub fn pull_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .pull_counts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .installed
            .iter()
            .any(|m| m.name == name)
    }
}

#[async_trait]
impl ModelService for MemoryModelService {
    async fn health(&self) -> bool {
        self.inner.lock().unwrap().healthy
    }

    async fn list_installed(&self) -> EngineResult<Vec<InstalledModel>> {
        let inner = self.inner.lock().unwrap();
        if !inner.healthy {
            return Err(EngineError::Unavailable("model service is down".to_string()));
        }
        Ok(inner.installed.clone())
    }

    async fn pull(&self, name: &str) -> EngineResult<PullStream> {
        let (script, delay) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(err) = &inner.open_failure {
                return Err(err.clone());
            }
            *inner.pull_counts.entry(name.to_string()).or_insert(0) += 1;
            (
                inner.scripts.get(name).cloned().unwrap_or_default(),
                inner.step_delay,
            )
        };

        let shared = self.inner.clone();
        let model = name.to_string();
        let queue: VecDeque<_> = script.items.into();

        let scripted = stream::unfold(queue, move |mut queue| {
            let shared = shared.clone();
            let model = model.clone();
            async move {
                let item = queue.pop_front()?;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if matches!(&item, Ok(p) if p.is_success()) {
                    let mut inner = shared.lock().unwrap();
                    if !inner.installed.iter().any(|m| m.name == model) {
                        inner.installed.push(InstalledModel::named(&model));
                    }
                }
                Some((item, queue))
            }
        });

        if script.hold_open {
            Ok(scripted.chain(stream::pending()).boxed())
        } else {
            Ok(scripted.boxed())
        }
    }
}

// ---------------------------------------------------------------------------
// StaticProbe
// ---------------------------------------------------------------------------

/// Port probe answering from a fixed set of open ports.
#[derive(Debug, Default)]
pub struct StaticProbe {
    open: Mutex<HashSet<u16>>,
    probes: AtomicUsize,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open(ports: &[u16]) -> Self {
        let probe = Self::default();
        probe.open.lock().unwrap().extend(ports.iter().copied());
        probe
    }

    pub fn set_open(&self, port: u16, open: bool) {
        let mut ports = self.open.lock().unwrap();
        if open {
            ports.insert(port);
        } else {
            ports.remove(&port);
        }
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProbe for StaticProbe {
    async fn is_open(&self, _host: &str, port: u16) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.open.lock().unwrap().contains(&port)
    }
}
