//! Deskpilot Core Library
//!
//! Orchestration and live-status layer for a sandboxed desktop container
//! and locally served model artifacts.
//!
//! ## Layer 2 - Orchestration
//!
//! - `broadcast`: topic-keyed pub/sub with non-blocking publish
//! - `build`: image builds relayed onto the `build` topic
//! - `lifecycle`: start / stop / delete / inspect / readiness of the container
//! - `poller`: per-container status ticks while observed
//! - `download`: per-artifact download state machine with throttled progress
//! - `config`, `telemetry`, `obs`, `metrics`: ambient plumbing

pub mod broadcast;
pub mod build;
pub mod config;
pub mod download;
pub mod lifecycle;
pub mod metrics;
pub mod obs;
pub mod poller;
pub mod telemetry;
pub mod throttle;

pub use broadcast::{Broadcaster, Subscription};
pub use build::{
    BuildError, BuildEvent, BuildHandle, BuildOrchestrator, BuildOutcome, BuildResult,
    BuildSnapshot, BuildStatus, BUILD_COMPLETED_MESSAGE, BUILD_TOPIC,
};
pub use config::{DeskConfig, CONTAINER_NAME, LOCAL_IMAGE_TAG, SERVICE_PORTS};
pub use download::{
    ArtifactState, ArtifactStatus, DownloadError, DownloadManager, DownloadResult,
    DownloadTicket, ProgressFeed, UNHEALTHY_MESSAGE,
};
pub use lifecycle::{
    ContainerState, ContainerStatus, DeleteOutcome, LifecycleError, LifecycleManager,
    LifecycleResult, StatusEvent,
};
pub use metrics::METRICS;
pub use obs::{
    emit_build_finished, emit_build_started, emit_container_deleted, emit_container_started,
    emit_container_stopped, emit_download_finished, emit_download_started,
    emit_observer_connected, emit_observer_disconnected, SubjectSpan,
};
pub use poller::StatusPoller;
pub use telemetry::init_tracing;
pub use throttle::Throttle;
