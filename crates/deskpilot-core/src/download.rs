//! Model artifact download manager
//!
//! Each artifact has one record guarded by its own lock. Starting a
//! download is a check-and-set of the record's status under that lock, so
//! two concurrent requests can never open two pull feeds for one artifact.
//!
//! Progress from the feed is mapped to a rounded, monotonic percentage and
//! republished through a [`Throttle`]. Terminal transitions flush any
//! pending throttled update and are then published immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use deskpilot_engine::{EngineError, InstalledModel, ModelService, PullStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::broadcast::{Broadcaster, Subscription};
use crate::metrics::METRICS;
use crate::obs;
use crate::throttle::Throttle;

/// Error attached to artifacts while the model service is down.
pub const UNHEALTHY_MESSAGE: &str = "Model service is not healthy";

const CANCELLED_MESSAGE: &str = "Download cancelled";
const INCOMPLETE_MESSAGE: &str = "Download ended before completion";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Model service is not healthy")]
    ServiceUnhealthy,

    #[error("invalid model name: {0:?}")]
    InvalidName(String),

    #[error("unknown model: {0}")]
    UnknownArtifact(String),

    #[error("model service error: {0}")]
    Service(#[from] EngineError),
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    NotDownloaded,
    Checking,
    Downloading,
    Ready,
    Error,
}

impl ArtifactStatus {
    /// `ready` or `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactStatus::Ready | ArtifactStatus::Error)
    }
}

/// Snapshot of one artifact, also the event type of its topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactState {
    pub name: String,
    pub status: ArtifactStatus,
    /// 0..=100, meaningful while downloading
    pub progress: u8,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,
    /// Bumped on every change; observers skip anything not newer
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl ArtifactState {
    fn checking(name: &str) -> Self {
        ArtifactState {
            name: name.to_string(),
            status: ArtifactStatus::Checking,
            progress: 0,
            downloaded_bytes: None,
            total_bytes: None,
            error: None,
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    /// Standalone error state for an artifact that has no record.
    pub fn failed(name: &str, message: impl Into<String>) -> Self {
        ArtifactState {
            status: ArtifactStatus::Error,
            error: Some(message.into()),
            ..ArtifactState::checking(name)
        }
    }
}

/// Result of [`DownloadManager::request_download`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadTicket {
    /// A new pull feed was opened
    Started,
    /// A download is already running; observe it instead
    AlreadyInProgress,
    /// The artifact is installed; nothing to do
    AlreadyReady,
}

/// Close handle of one pull feed. Closing is idempotent and may race.
#[derive(Debug, Clone, Default)]
pub struct ProgressFeed {
    closed: Arc<AtomicBool>,
    token: CancellationToken,
}

impl ProgressFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the feed. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }

    fn same_as(&self, other: &ProgressFeed) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    percent: u8,
    completed: Option<u64>,
    total: Option<u64>,
}

struct ArtifactRecord {
    state: Mutex<ArtifactState>,
    watch: watch::Sender<ArtifactState>,
}

impl ArtifactRecord {
    fn new(name: &str) -> Self {
        let initial = ArtifactState::checking(name);
        let (watch, _) = watch::channel(initial.clone());
        ArtifactRecord {
            state: Mutex::new(initial),
            watch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArtifactState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self) -> ArtifactState {
        self.lock().clone()
    }

    /// Apply `f` under the artifact lock. When it reports a change, the new
    /// state is published before the lock is released.
    fn update<F>(&self, events: &Broadcaster<ArtifactState>, f: F) -> ArtifactState
    where
        F: FnOnce(&mut ArtifactState) -> bool,
    {
        let mut state = self.lock();
        if f(&mut state) {
            state.revision += 1;
            state.updated_at = Utc::now();
            events.publish(&state.name, state.clone());
            self.watch.send_replace(state.clone());
        }
        state.clone()
    }
}

fn same_model(installed: &str, requested: &str) -> bool {
    installed == requested
        || installed.strip_suffix(":latest") == Some(requested)
        || requested.strip_suffix(":latest") == Some(installed)
}

fn validate_name(name: &str) -> DownloadResult<()> {
    if name.trim().is_empty() {
        return Err(DownloadError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    service: Arc<dyn ModelService>,
    events: Broadcaster<ArtifactState>,
    artifacts: Mutex<HashMap<String, Arc<ArtifactRecord>>>,
    feeds: Mutex<HashMap<String, ProgressFeed>>,
    healthy: AtomicBool,
    throttle: Duration,
}

impl Inner {
    fn artifacts(&self) -> MutexGuard<'_, HashMap<String, Arc<ArtifactRecord>>> {
        self.artifacts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn feeds(&self) -> MutexGuard<'_, HashMap<String, ProgressFeed>> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-artifact download state machine over a [`ModelService`].
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(
        service: Arc<dyn ModelService>,
        events: Broadcaster<ArtifactState>,
        throttle: Duration,
    ) -> Self {
        DownloadManager {
            inner: Arc::new(Inner {
                service,
                events,
                artifacts: Mutex::new(HashMap::new()),
                feeds: Mutex::new(HashMap::new()),
                healthy: AtomicBool::new(true),
                throttle,
            }),
        }
    }

    /// Result of the last health check (optimistic before the first one).
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }

    fn record(&self, name: &str) -> (Arc<ArtifactRecord>, bool) {
        let mut artifacts = self.inner.artifacts();
        if let Some(existing) = artifacts.get(name) {
            return (Arc::clone(existing), false);
        }
        let record = Arc::new(ArtifactRecord::new(name));
        artifacts.insert(name.to_string(), Arc::clone(&record));
        (record, true)
    }

    fn existing(&self, name: &str) -> Option<Arc<ArtifactRecord>> {
        self.inner.artifacts().get(name).cloned()
    }

    /// Current state of `name`, resolving it against the installed list on
    /// first query.
    pub async fn status(&self, name: &str) -> DownloadResult<ArtifactState> {
        validate_name(name)?;
        let (record, fresh) = self.record(name);
        if fresh {
            return Ok(self.resolve(&record).await);
        }
        Ok(record.current())
    }

    /// Re-run the installed-list check for `name`. This is the only way
    /// out of `ready`.
    pub async fn recheck(&self, name: &str) -> DownloadResult<ArtifactState> {
        validate_name(name)?;
        let (record, _) = self.record(name);
        record.update(&self.inner.events, |s| {
            if s.status == ArtifactStatus::Downloading {
                return false;
            }
            s.status = ArtifactStatus::Checking;
            true
        });
        Ok(self.resolve(&record).await)
    }

    /// Periodic form of [`recheck`](Self::recheck) for status observers.
    ///
    /// Publishes only when the installed list flips `name` between ready and
    /// not downloaded, so a quiet artifact produces no events. Downloads in
    /// flight and failed downloads are left alone.
    pub async fn reconcile(&self, name: &str) -> DownloadResult<ArtifactState> {
        validate_name(name)?;
        let (record, fresh) = self.record(name);
        if fresh {
            return Ok(self.resolve(&record).await);
        }
        if !self.is_healthy() {
            return Ok(record.update(&self.inner.events, |s| {
                if s.error.as_deref() == Some(UNHEALTHY_MESSAGE) {
                    return false;
                }
                mark_unhealthy(s)
            }));
        }

        let installed = match self.inner.service.list_installed().await {
            Ok(models) => models.iter().any(|m| same_model(&m.name, name)),
            Err(e) => {
                obs::emit_collaborator_error("list_installed", &e);
                return Ok(record.current());
            }
        };
        Ok(record.update(&self.inner.events, |s| match (s.status, installed) {
            (ArtifactStatus::Downloading, _)
            | (ArtifactStatus::Ready, true)
            | (ArtifactStatus::NotDownloaded, false)
            | (ArtifactStatus::Error, false) => false,
            (_, true) => {
                s.status = ArtifactStatus::Ready;
                s.progress = 100;
                s.error = None;
                true
            }
            (_, false) => {
                s.status = ArtifactStatus::NotDownloaded;
                s.progress = 0;
                s.error = None;
                true
            }
        }))
    }

    async fn resolve(&self, record: &ArtifactRecord) -> ArtifactState {
        let name = record.current().name;
        if !self.is_healthy() {
            return record.update(&self.inner.events, mark_unhealthy);
        }

        match self.inner.service.list_installed().await {
            Ok(models) => {
                let installed = models.iter().any(|m| same_model(&m.name, &name));
                record.update(&self.inner.events, |s| {
                    if s.status == ArtifactStatus::Downloading {
                        return false;
                    }
                    if installed {
                        s.status = ArtifactStatus::Ready;
                        s.progress = 100;
                    } else {
                        s.status = ArtifactStatus::NotDownloaded;
                        s.progress = 0;
                    }
                    s.error = None;
                    true
                })
            }
            Err(e) => {
                obs::emit_collaborator_error("list_installed", &e);
                record.update(&self.inner.events, |s| {
                    if s.status == ArtifactStatus::Downloading {
                        return false;
                    }
                    s.status = ArtifactStatus::Error;
                    s.error = Some(e.to_string());
                    true
                })
            }
        }
    }

    /// Probe the model service. When it is down, every artifact that is not
    /// downloading moves to `error` and new downloads are refused until a
    /// later check succeeds.
    pub async fn check_health(&self) -> bool {
        let healthy = self.inner.service.health().await;
        let was_healthy = self.inner.healthy.swap(healthy, Ordering::SeqCst);

        if !healthy {
            if was_healthy {
                warn!("model service became unhealthy");
            }
            let records: Vec<_> = self.inner.artifacts().values().cloned().collect();
            for record in records {
                record.update(&self.inner.events, mark_unhealthy);
            }
        } else if !was_healthy {
            info!("model service healthy again");
        }
        healthy
    }

    /// List installed models and mark matching artifacts `ready`.
    pub async fn refresh(&self) -> DownloadResult<Vec<InstalledModel>> {
        let models = self.inner.service.list_installed().await?;
        for model in &models {
            self.record(&model.name);
        }

        let records: Vec<_> = self.inner.artifacts().values().cloned().collect();
        for record in records {
            let name = record.current().name;
            if !models.iter().any(|m| same_model(&m.name, &name)) {
                continue;
            }
            record.update(&self.inner.events, |s| {
                if matches!(s.status, ArtifactStatus::Downloading | ArtifactStatus::Ready) {
                    return false;
                }
                s.status = ArtifactStatus::Ready;
                s.progress = 100;
                s.error = None;
                true
            });
        }
        Ok(models)
    }

    /// Every known artifact, sorted by name.
    pub fn list(&self) -> Vec<ArtifactState> {
        let mut states: Vec<ArtifactState> = self
            .inner
            .artifacts()
            .values()
            .map(|r| r.current())
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Start downloading `name` unless it is already downloading or ready.
    pub async fn request_download(&self, name: &str) -> DownloadResult<DownloadTicket> {
        validate_name(name)?;
        if !self.is_healthy() {
            return Err(DownloadError::ServiceUnhealthy);
        }

        let (record, _) = self.record(name);
        let mut ticket = DownloadTicket::Started;
        record.update(&self.inner.events, |s| match s.status {
            ArtifactStatus::Downloading => {
                ticket = DownloadTicket::AlreadyInProgress;
                false
            }
            ArtifactStatus::Ready => {
                ticket = DownloadTicket::AlreadyReady;
                false
            }
            _ => {
                s.status = ArtifactStatus::Downloading;
                s.progress = 0;
                s.downloaded_bytes = None;
                s.total_bytes = None;
                s.error = None;
                true
            }
        });

        match ticket {
            DownloadTicket::Started => {}
            DownloadTicket::AlreadyInProgress => {
                info!(artifact = %name, "download already in progress");
                return Ok(ticket);
            }
            DownloadTicket::AlreadyReady => {
                debug!(artifact = %name, "artifact already installed");
                return Ok(ticket);
            }
        }

        let feed = ProgressFeed::new();
        self.inner.feeds().insert(name.to_string(), feed.clone());
        METRICS.inc_downloads_started();
        obs::emit_download_started(name);

        tokio::spawn(
            run_download(Arc::clone(&self.inner), record, feed)
                .instrument(obs::subject_span("download", name)),
        );
        Ok(DownloadTicket::Started)
    }

    /// Subscribe to state changes of `name`.
    pub fn subscribe(&self, name: &str) -> Subscription<ArtifactState> {
        self.inner.events.subscribe(name)
    }

    /// Current state without triggering a listing.
    pub fn snapshot(&self, name: &str) -> Option<ArtifactState> {
        self.existing(name).map(|r| r.current())
    }

    /// Wait until `name` is `ready` or `error`.
    pub async fn wait_terminal(&self, name: &str) -> DownloadResult<ArtifactState> {
        let record = self
            .existing(name)
            .ok_or_else(|| DownloadError::UnknownArtifact(name.to_string()))?;
        let mut rx = record.watch.subscribe();
        // The sender lives in `record`, which we hold.
        let _ = rx.wait_for(|s| s.status.is_terminal()).await;
        Ok(record.current())
    }

    /// Close the in-flight feed of `name`; the download ends in `error`.
    pub fn cancel(&self, name: &str) -> bool {
        match self.inner.feeds().get(name) {
            Some(feed) => feed.close(),
            None => false,
        }
    }

    /// Close every in-flight feed.
    pub fn shutdown(&self) {
        let feeds: Vec<ProgressFeed> = self.inner.feeds().values().cloned().collect();
        for feed in feeds {
            feed.close();
        }
    }
}

fn mark_unhealthy(s: &mut ArtifactState) -> bool {
    if s.status == ArtifactStatus::Downloading {
        return false;
    }
    s.status = ArtifactStatus::Error;
    s.error = Some(UNHEALTHY_MESSAGE.to_string());
    true
}

async fn run_download(inner: Arc<Inner>, record: Arc<ArtifactRecord>, feed: ProgressFeed) {
    let started = Instant::now();
    let name = record.current().name;

    let opened = tokio::select! {
        biased;
        _ = feed.closed() => Err(CANCELLED_MESSAGE.to_string()),
        opened = inner.service.pull(&name) => opened.map_err(|e| e.to_string()),
    };
    let outcome = match opened {
        Ok(stream) => pump(&inner, &record, &feed, stream).await,
        Err(message) => Err(message),
    };

    let terminal = record.update(&inner.events, |s| {
        match &outcome {
            Ok(()) => {
                s.status = ArtifactStatus::Ready;
                s.progress = 100;
                s.error = None;
            }
            Err(message) => {
                s.status = ArtifactStatus::Error;
                s.error = Some(message.clone());
            }
        }
        true
    });

    feed.close();
    {
        let mut feeds = inner.feeds();
        if feeds.get(&name).is_some_and(|f| f.same_as(&feed)) {
            feeds.remove(&name);
        }
    }

    if let Err(message) = &outcome {
        warn!(artifact = %name, error = %message, "download failed");
    }
    let status = serde_json::to_value(terminal.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    obs::emit_download_finished(&name, &status, started.elapsed().as_millis() as u64);
}

/// Drive the pull feed until a terminal condition. Intermediate progress
/// goes through the throttle; every exit path flushes it first.
async fn pump(
    inner: &Inner,
    record: &ArtifactRecord,
    feed: &ProgressFeed,
    mut stream: PullStream,
) -> Result<(), String> {
    let mut throttle: Throttle<Progress> = Throttle::new(inner.throttle);
    // Highest progress seen; its byte counts travel with it.
    let mut best: Option<Progress> = None;

    let apply = |p: Progress| {
        record.update(&inner.events, |s| {
            s.progress = p.percent;
            s.downloaded_bytes = p.completed;
            s.total_bytes = p.total;
            true
        });
    };
    let flush = |t: &mut Throttle<Progress>| {
        if let Some(p) = t.flush() {
            apply(p);
        }
    };

    loop {
        let deadline = throttle.deadline();
        tokio::select! {
            biased;
            _ = feed.closed() => {
                flush(&mut throttle);
                return Err(CANCELLED_MESSAGE.to_string());
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(p) = throttle.take_due(Instant::now()) {
                    apply(p);
                }
            }
            item = stream.next() => match item {
                None => {
                    flush(&mut throttle);
                    return Err(INCOMPLETE_MESSAGE.to_string());
                }
                Some(Err(e)) => {
                    flush(&mut throttle);
                    return Err(e.to_string());
                }
                Some(Ok(progress)) => {
                    if let Some(error) = progress.error {
                        flush(&mut throttle);
                        return Err(error);
                    }
                    if progress.is_success() {
                        flush(&mut throttle);
                        return Ok(());
                    }
                    if let Some(percent) = progress.percent() {
                        if best.as_ref().is_some_and(|b| percent < b.percent) {
                            continue;
                        }
                        let update = Progress {
                            percent,
                            completed: progress.completed,
                            total: progress.total,
                        };
                        best = Some(update);
                        if let Some(now) = throttle.offer(update, Instant::now()) {
                            apply(now);
                        }
                    }
                }
            },
        }
    }
}
