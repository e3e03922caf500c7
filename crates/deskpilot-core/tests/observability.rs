//! Observability tests for deskpilot lifecycle tracing.
//!
//! These tests verify that the structured emission helpers and subject spans
//! work under a captured subscriber, and that orchestration paths that emit
//! them also move the process counters.

use std::sync::Arc;

use deskpilot_core::obs::{emit_collaborator_error, subject_span};
use deskpilot_core::{
    emit_build_finished, emit_build_started, emit_container_deleted, emit_container_started,
    emit_container_stopped, emit_download_finished, emit_download_started,
    emit_observer_connected, emit_observer_disconnected, BuildOrchestrator, Broadcaster,
    DownloadManager, SubjectSpan, METRICS,
};
use deskpilot_engine::fakes::{MemoryEngine, MemoryModelService};
use tracing::Instrument;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_build_events() {
    emit_build_started("b-123", "desk:latest", "Dockerfile");
    emit_build_finished("b-123", true, 42, 1500);
}

#[traced_test]
#[test]
fn test_emit_container_transitions() {
    emit_container_started("c-1", "desk:latest", true);
    emit_container_stopped("c-1");
    emit_container_deleted("c-1");
}

#[traced_test]
#[test]
fn test_emit_download_events() {
    emit_download_started("demo-model");
    emit_download_finished("demo-model", "ready", 3200);
}

#[traced_test]
#[test]
fn test_emit_observer_events() {
    emit_observer_connected("build", "b-1");
    emit_observer_disconnected("build", "b-1", 17);
}

/// WARN-level events are captured too.
#[traced_test]
#[test]
fn test_emit_collaborator_error_logs_warning() {
    let error = "connection refused";
    emit_collaborator_error("list_installed", &error);
}

#[traced_test]
#[test]
fn test_subject_span_enter_and_drop() {
    let span = SubjectSpan::enter("status", "c-1");
    drop(span);
}

#[traced_test]
#[tokio::test]
async fn test_instrumented_task_runs_inside_subject_span() {
    let handle = tokio::spawn(
        async {
            tracing::info!("inside");
            7
        }
        .instrument(subject_span("download", "demo-model")),
    );
    assert_eq!(handle.await.unwrap(), 7);
}

/// Counters are process-wide and other tests run concurrently, so only
/// lower bounds are checked.
#[traced_test]
#[tokio::test]
async fn test_orchestration_moves_counters() {
    let builds_before = METRICS.builds_started();
    let downloads_before = METRICS.downloads_started();
    let published_before = METRICS.events_published();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM ubuntu:22.04\n").unwrap();
    let builds = BuildOrchestrator::new(
        Arc::new(MemoryEngine::new()),
        Broadcaster::new(16),
        dir.path(),
    );
    let _sub = builds.subscribe();
    builds.build("Dockerfile", "desk:obs").await.unwrap();

    let service = MemoryModelService::new();
    let downloads = DownloadManager::new(
        Arc::new(service.clone()),
        Broadcaster::new(16),
        std::time::Duration::from_millis(10),
    );
    downloads.request_download("demo-model").await.unwrap();
    downloads.wait_terminal("demo-model").await.unwrap();

    assert!(METRICS.builds_started() > builds_before);
    assert!(METRICS.downloads_started() > downloads_before);
    assert!(METRICS.events_published() > published_before);
}
