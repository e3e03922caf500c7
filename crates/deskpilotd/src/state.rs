//! Shared service graph handed to every handler.

use std::sync::Arc;
use std::time::Duration;

use deskpilot_core::{
    BuildOrchestrator, Broadcaster, DeskConfig, DownloadManager, LifecycleManager, StatusPoller,
};
use deskpilot_engine::{ContainerEngine, ModelService, PortProbe};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Explicitly constructed services, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub builds: Arc<BuildOrchestrator>,
    pub lifecycle: Arc<LifecycleManager>,
    pub poller: Arc<StatusPoller>,
    pub downloads: DownloadManager,
    /// Shared secret required on every route except `/health`
    pub api_key: Arc<str>,
    pub keepalive: Duration,
    /// Period of installed-list checks on artifact status streams
    pub poll_interval: Duration,
    /// Cancelled once the server begins shutting down; ends every stream
    pub closing: CancellationToken,
}

impl AppState {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        models: Arc<dyn ModelService>,
        probe: Arc<dyn PortProbe>,
        config: &DeskConfig,
        api_key: &str,
    ) -> Self {
        let builds = Arc::new(BuildOrchestrator::new(
            Arc::clone(&engine),
            Broadcaster::new(config.event_buffer),
            &config.recipe_dir,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            engine,
            Arc::clone(&builds),
            probe,
            config,
        ));
        let poller = Arc::new(StatusPoller::new(
            Arc::clone(&lifecycle),
            Broadcaster::new(config.event_buffer),
            config.poll_interval(),
        ));
        let downloads = DownloadManager::new(
            models,
            Broadcaster::new(config.event_buffer),
            config.throttle_interval(),
        );

        AppState {
            builds,
            lifecycle,
            poller,
            downloads,
            api_key: Arc::from(api_key),
            keepalive: config.keepalive_interval(),
            poll_interval: config.poll_interval(),
            closing: CancellationToken::new(),
        }
    }

    /// End every open stream and close every download feed. Without this a
    /// graceful shutdown waits on stream clients forever.
    pub fn begin_shutdown(&self) {
        if self.closing.is_cancelled() {
            return;
        }
        info!("shutting down streams and downloads");
        self.closing.cancel();
        self.downloads.shutdown();
    }
}
