//! Image build orchestration
//!
//! A build is validated and its context enumerated before the engine is
//! touched. The driver task then relays the engine's raw progress through a
//! bounded channel onto the `build` topic and finishes with exactly one
//! terminal event.
//!
//! Builds are single-flight per target tag: a second request for a tag that
//! is already building joins the running build instead of starting another.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use deskpilot_engine::{BuildProgress, BuildRequest, ContainerEngine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

use crate::broadcast::{Broadcaster, Subscription};
use crate::metrics::METRICS;
use crate::obs;

/// Topic every build event is published on.
pub const BUILD_TOPIC: &str = "build";

/// Message carried by the `completed` terminal event.
pub const BUILD_COMPLETED_MESSAGE: &str = "Build completed successfully";

/// Buffer between the engine and the relay.
const PROGRESS_BUFFER: usize = 64;

/// Finished builds kept for snapshots; older ones are forgotten.
pub const DEFAULT_RETAINED_BUILDS: usize = 16;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("invalid recipe name: {0:?}")]
    InvalidRecipe(String),

    #[error("build context unavailable at {path}: {reason}")]
    ContextUnavailable { path: String, reason: String },

    #[error("recipe {recipe} not found in {dir}")]
    RecipeNotFound { recipe: String, dir: String },

    #[error("unknown build: {0}")]
    UnknownBuild(String),

    #[error("build {build_id} failed: {message}")]
    Failed { build_id: String, message: String },
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;

// ---------------------------------------------------------------------------
// Events and snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Started,
    Building,
    Completed,
    Error,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Completed | BuildStatus::Error)
    }
}

/// One event on the `build` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub build_id: String,
    /// Position within the build, starting at 0 for `started`
    pub seq: u64,
    pub status: BuildStatus,
    /// Raw engine line, or the completion/error message for terminal events
    pub stream: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of a build, including the accumulated raw log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub build_id: String,
    pub tag: String,
    pub recipe: String,
    pub status: BuildStatus,
    /// `seq` of the last event folded into this snapshot
    pub seq: u64,
    pub log: Vec<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Returned by [`BuildOrchestrator::start_build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildHandle {
    pub build_id: String,
    /// True when the request joined a build already running for the tag
    pub coalesced: bool,
}

/// Successful build summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub build_id: String,
    pub tag: String,
    pub lines: usize,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

struct BuildJob {
    snapshot: Mutex<BuildSnapshot>,
    done: watch::Sender<bool>,
}

impl BuildJob {
    fn lock(&self) -> MutexGuard<'_, BuildSnapshot> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> BuildSnapshot {
        self.lock().clone()
    }

    /// Fold an event into the snapshot and publish it under the job lock,
    /// so snapshot readers and subscribers agree on `seq`.
    fn record(&self, events: &Broadcaster<BuildEvent>, status: BuildStatus, line: String) {
        let mut snap = self.lock();
        if snap.status.is_terminal() {
            return;
        }
        snap.seq += 1;
        snap.status = status;
        match status {
            BuildStatus::Building => snap.log.push(line.clone()),
            BuildStatus::Error => {
                snap.error = Some(line.clone());
                snap.finished_at = Some(Utc::now());
            }
            BuildStatus::Completed => snap.finished_at = Some(Utc::now()),
            BuildStatus::Started => {}
        }
        events.publish(
            BUILD_TOPIC,
            BuildEvent {
                build_id: snap.build_id.clone(),
                seq: snap.seq,
                status,
                stream: line,
                timestamp: Utc::now(),
            },
        );
        if status.is_terminal() {
            self.done.send_replace(true);
        }
    }
}

struct Registry {
    jobs: HashMap<String, Arc<BuildJob>>,
    active_by_tag: HashMap<String, String>,
    latest: Option<String>,
    /// Finished build ids, oldest first
    finished: VecDeque<String>,
    retained: usize,
}

impl Registry {
    fn new(retained: usize) -> Self {
        Registry {
            jobs: HashMap::new(),
            active_by_tag: HashMap::new(),
            latest: None,
            finished: VecDeque::new(),
            retained,
        }
    }

    /// Mark `build_id` finished and drop the oldest finished builds beyond
    /// the retention limit. The latest build is never dropped.
    fn finish(&mut self, build_id: &str, tag: &str) {
        if self.active_by_tag.get(tag).map(String::as_str) == Some(build_id) {
            self.active_by_tag.remove(tag);
        }
        self.finished.push_back(build_id.to_string());
        while self.finished.len() > self.retained {
            let Some(old) = self.finished.pop_front() else {
                break;
            };
            if self.latest.as_deref() == Some(old.as_str()) {
                self.finished.push_front(old);
                break;
            }
            self.jobs.remove(&old);
            debug!(build_id = %old, "forgot finished build");
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives image builds and relays their progress.
pub struct BuildOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    events: Broadcaster<BuildEvent>,
    recipe_dir: PathBuf,
    registry: Arc<Mutex<Registry>>,
}

impl BuildOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        events: Broadcaster<BuildEvent>,
        recipe_dir: impl Into<PathBuf>,
    ) -> Self {
        BuildOrchestrator {
            engine,
            events,
            recipe_dir: recipe_dir.into(),
            registry: Arc::new(Mutex::new(Registry::new(DEFAULT_RETAINED_BUILDS))),
        }
    }

    /// Keep at most `n` finished builds (at least one).
    pub fn with_retained_builds(self, n: usize) -> Self {
        self.registry().retained = n.max(1);
        self
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to the `build` topic (events of every build).
    pub fn subscribe(&self) -> Subscription<BuildEvent> {
        self.events.subscribe(BUILD_TOPIC)
    }

    /// Validate, register and launch a build of `recipe` tagged `tag`.
    pub async fn start_build(&self, recipe: &str, tag: &str) -> BuildResult<BuildHandle> {
        validate_recipe(recipe)?;
        let files = self.context_files().await?;
        if files.is_empty() || !files.iter().any(|f| f == recipe) {
            return Err(BuildError::RecipeNotFound {
                recipe: recipe.to_string(),
                dir: self.recipe_dir.display().to_string(),
            });
        }

        let (job, build_id) = {
            let mut registry = self.registry();
            if let Some(existing) = registry.active_by_tag.get(tag) {
                info!(build_id = %existing, tag = %tag, "joining running build");
                return Ok(BuildHandle {
                    build_id: existing.clone(),
                    coalesced: true,
                });
            }

            let build_id = uuid::Uuid::new_v4().to_string();
            let (done, _) = watch::channel(false);
            let job = Arc::new(BuildJob {
                snapshot: Mutex::new(BuildSnapshot {
                    build_id: build_id.clone(),
                    tag: tag.to_string(),
                    recipe: recipe.to_string(),
                    status: BuildStatus::Started,
                    seq: 0,
                    log: Vec::new(),
                    error: None,
                    started_at: Utc::now(),
                    finished_at: None,
                }),
                done,
            });
            registry.jobs.insert(build_id.clone(), Arc::clone(&job));
            registry.active_by_tag.insert(tag.to_string(), build_id.clone());
            registry.latest = Some(build_id.clone());

            // `started` goes out before the registry lock is released so no
            // event of this build can precede it.
            self.events.publish(
                BUILD_TOPIC,
                BuildEvent {
                    build_id: build_id.clone(),
                    seq: 0,
                    status: BuildStatus::Started,
                    stream: format!("Building {tag} from {recipe}"),
                    timestamp: Utc::now(),
                },
            );
            (job, build_id)
        };

        METRICS.inc_builds_started();
        obs::emit_build_started(&build_id, tag, recipe);

        let request = BuildRequest::cached(self.recipe_dir.clone(), files, recipe, tag);
        tokio::spawn(
            drive_build(
                Arc::clone(&self.engine),
                self.events.clone(),
                Arc::clone(&self.registry),
                job,
                request,
            )
            .instrument(obs::subject_span("build", &build_id)),
        );

        Ok(BuildHandle {
            build_id,
            coalesced: false,
        })
    }

    /// Start (or join) a build and wait for its terminal event.
    pub async fn build(&self, recipe: &str, tag: &str) -> BuildResult<BuildOutcome> {
        let handle = self.start_build(recipe, tag).await?;
        let snap = self.wait(&handle.build_id).await?;
        match snap.status {
            BuildStatus::Completed => Ok(BuildOutcome {
                build_id: snap.build_id,
                tag: snap.tag,
                lines: snap.log.len(),
            }),
            _ => Err(BuildError::Failed {
                build_id: snap.build_id,
                message: snap.error.unwrap_or_default(),
            }),
        }
    }

    /// Wait until `build_id` reaches a terminal state.
    pub async fn wait(&self, build_id: &str) -> BuildResult<BuildSnapshot> {
        let job = self.job(build_id)?;
        let mut done = job.done.subscribe();
        // The sender lives in `job`, which we hold, so this cannot fail.
        let _ = done.wait_for(|finished| *finished).await;
        Ok(job.snapshot())
    }

    pub fn snapshot(&self, build_id: &str) -> Option<BuildSnapshot> {
        self.job(build_id).ok().map(|job| job.snapshot())
    }

    /// Snapshot of the most recently started build.
    pub fn latest(&self) -> Option<BuildSnapshot> {
        let registry = self.registry();
        let id = registry.latest.as_ref()?;
        registry.jobs.get(id).map(|job| job.snapshot())
    }

    /// Recipe file names in the recipe directory, sorted.
    pub async fn list_recipes(&self) -> BuildResult<Vec<String>> {
        let mut recipes: Vec<String> = self
            .context_files()
            .await?
            .into_iter()
            .filter(|name| name.to_lowercase().contains("dockerfile"))
            .collect();
        recipes.sort();
        Ok(recipes)
    }

    fn job(&self, build_id: &str) -> BuildResult<Arc<BuildJob>> {
        self.registry()
            .jobs
            .get(build_id)
            .cloned()
            .ok_or_else(|| BuildError::UnknownBuild(build_id.to_string()))
    }

    async fn context_files(&self) -> BuildResult<Vec<String>> {
        let unavailable = |e: std::io::Error| BuildError::ContextUnavailable {
            path: self.recipe_dir.display().to_string(),
            reason: e.to_string(),
        };

        let mut entries = tokio::fs::read_dir(&self.recipe_dir)
            .await
            .map_err(unavailable)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
        files.sort();
        Ok(files)
    }
}

fn validate_recipe(recipe: &str) -> BuildResult<()> {
    let trimmed = recipe.trim();
    if trimmed.is_empty()
        || trimmed != recipe
        || recipe.contains('/')
        || recipe.contains('\\')
        || recipe == "."
        || recipe == ".."
    {
        return Err(BuildError::InvalidRecipe(recipe.to_string()));
    }
    Ok(())
}

async fn drive_build(
    engine: Arc<dyn ContainerEngine>,
    events: Broadcaster<BuildEvent>,
    registry: Arc<Mutex<Registry>>,
    job: Arc<BuildJob>,
    request: BuildRequest,
) {
    let started = Instant::now();
    let (build_id, tag) = {
        let snap = job.lock();
        (snap.build_id.clone(), snap.tag.clone())
    };

    let (tx, mut rx) = mpsc::channel::<BuildProgress>(PROGRESS_BUFFER);
    let relay = async {
        let mut lines = 0u64;
        while let Some(progress) = rx.recv().await {
            job.record(&events, BuildStatus::Building, progress.line());
            lines += 1;
        }
        lines
    };

    // The relay ends once the engine drops its sender, so the terminal
    // event below always follows the last `building` event.
    let (result, lines) = tokio::join!(engine.build_image(request, tx), relay);
    debug!(build_id = %build_id, lines, "build relay drained");

    // Retention runs before the terminal event so a waiter that wakes on it
    // already sees the pruned registry.
    registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .finish(&build_id, &tag);

    let success = match result {
        Ok(()) => {
            job.record(&events, BuildStatus::Completed, BUILD_COMPLETED_MESSAGE.to_string());
            true
        }
        Err(e) => {
            warn!(build_id = %build_id, error = %e, "build failed");
            job.record(&events, BuildStatus::Error, e.to_string());
            false
        }
    };

    obs::emit_build_finished(&build_id, success, lines, started.elapsed().as_millis() as u64);
}
