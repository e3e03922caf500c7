//! Structured observability hooks for deskpilot lifecycle events.
//!
//! This module provides:
//! - Subject-scoped tracing spans via the `SubjectSpan` RAII guard
//! - Emission functions for builds, container transitions, downloads and
//!   stream observers
//!
//! Events are emitted at `info!` level with a stable `event` field so that
//! JSON log pipelines can filter on it.

use tracing::{info, warn};

/// RAII guard that enters a subject-scoped span (a build, container or
/// artifact) for as long as it is held.
pub struct SubjectSpan {
    _span: tracing::span::EnteredSpan,
}

impl SubjectSpan {
    pub fn enter(kind: &str, subject: &str) -> Self {
        Self {
            _span: subject_span(kind, subject).entered(),
        }
    }
}

/// Detached span for a subject, for instrumenting spawned tasks.
pub fn subject_span(kind: &str, subject: &str) -> tracing::Span {
    tracing::info_span!("deskpilot.subject", kind = %kind, subject = %subject)
}

pub fn emit_build_started(build_id: &str, tag: &str, recipe: &str) {
    info!(event = "build.started", build_id = %build_id, tag = %tag, recipe = %recipe);
}

pub fn emit_build_finished(build_id: &str, success: bool, lines: u64, duration_ms: u64) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        success = success,
        lines = lines,
        duration_ms = duration_ms,
    );
}

pub fn emit_container_started(container_id: &str, image: &str, created: bool) {
    info!(
        event = "container.started",
        container_id = %container_id,
        image = %image,
        created = created,
    );
}

pub fn emit_container_stopped(container_id: &str) {
    info!(event = "container.stopped", container_id = %container_id);
}

pub fn emit_container_deleted(container_id: &str) {
    info!(event = "container.deleted", container_id = %container_id);
}

pub fn emit_download_started(artifact: &str) {
    info!(event = "download.started", artifact = %artifact);
}

pub fn emit_download_finished(artifact: &str, status: &str, duration_ms: u64) {
    info!(
        event = "download.finished",
        artifact = %artifact,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_observer_connected(stream: &str, subject: &str) {
    info!(event = "observer.connected", stream = %stream, subject = %subject);
}

pub fn emit_observer_disconnected(stream: &str, subject: &str, delivered: u64) {
    info!(
        event = "observer.disconnected",
        stream = %stream,
        subject = %subject,
        delivered = delivered,
    );
}

/// Collaborator failure that was reported to the caller rather than raised.
pub fn emit_collaborator_error(operation: &str, error: &dyn std::fmt::Display) {
    warn!(event = "collaborator.error", operation = %operation, error = %error);
}
