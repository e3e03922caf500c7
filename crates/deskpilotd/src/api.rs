//! HTTP routes of the gateway.
//!
//! Control requests are JSON in, JSON out with an `ok` flag. Stream routes
//! answer with server-sent events: one `snapshot` record, then relayed
//! events and periodic `keepalive` records.


use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use deskpilot_core::{
    ArtifactState, BuildEvent, ContainerState, DeleteOutcome, DownloadTicket, LifecycleError,
    StatusEvent, LOCAL_IMAGE_TAG,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::auth::{ControlAuth, StreamAuth};
use crate::error::ApiError;
use crate::sse::{data_event, relay, snapshot_event, EventStream, ObserverGuard, Step};
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/docker", post(docker_action).get(docker_stream))
        .route("/api/llm/ollama/health", get(model_health))
        .route("/api/llm/ollama/list", get(model_list))
        .route("/api/llm/ollama/pull", post(pull_model).get(pull_stream))
        .route("/api/llm/ollama/status", get(model_status_stream))
        .route("/health", get(health_check))
        .layer(from_fn(log_requests))
        .with_state(state)
}

// Query strings carry the API key, so only the path is logged.
async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let resp = next.run(req).await;
    debug!(
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );
    resp
}

async fn health_check() -> &'static str {
    "ok"
}

fn required(value: Option<String>, message: &str) -> ApiResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request(message))
}

// -- Docker control --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerActionBody {
    pub action: String,
    pub image_name: Option<String>,
    pub dockerfile: Option<String>,
    pub container_id: Option<String>,
    #[serde(default)]
    pub is_local_dockerfile: bool,
    pub command: Option<String>,
}

async fn docker_action(
    _auth: ControlAuth,
    State(state): State<AppState>,
    body: Result<Json<DockerActionBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    debug!(action = %body.action, "docker action");

    match body.action.as_str() {
        "buildImage" => {
            let recipe = required(body.dockerfile, "Dockerfile is required for building")?;
            let handle = state
                .builds
                .start_build(&recipe, LOCAL_IMAGE_TAG)
                .await
                .map_err(|e| ApiError::build("Failed to start image build", e))?;
            Ok(Json(json!({
                "ok": true,
                "message": "Image build started",
                "buildId": handle.build_id,
                "coalesced": handle.coalesced,
            })))
        }
        "startContainer" => {
            let image = body.image_name.unwrap_or_else(|| "Dockerfile".to_string());
            match state.lifecycle.start(&image, body.is_local_dockerfile).await {
                Ok(id) => Ok(Json(json!({
                    "ok": true,
                    "message": "Container started",
                    "id": id,
                }))),
                // The id of a created-but-not-started container stays
                // retrievable through the error text.
                Err(LifecycleError::StartFailed {
                    message,
                    container_id: Some(id),
                }) => Err(ApiError::internal(
                    "Failed to start container",
                    format!("{message} (container {id})"),
                )),
                Err(e) => Err(ApiError::lifecycle("Failed to start container", e)),
            }
        }
        "stopContainer" => {
            let id = required(body.container_id, "Container ID is required")?;
            state
                .lifecycle
                .stop(&id)
                .await
                .map_err(|e| ApiError::lifecycle("Failed to stop container", e))?;
            Ok(Json(json!({ "ok": true, "message": "Container stopped" })))
        }
        "deleteContainer" => {
            let outcome = state
                .lifecycle
                .delete()
                .await
                .map_err(|e| ApiError::lifecycle("Failed to delete container", e))?;
            match outcome {
                DeleteOutcome::Deleted { id } => Ok(Json(json!({
                    "ok": true,
                    "message": "Container deleted successfully",
                    "id": id,
                }))),
                DeleteOutcome::NotFound => Err(ApiError::not_found("No container found to delete")),
            }
        }
        "getContainerStatus" => {
            let id = required(body.container_id, "Container ID is required")?;
            let status = state
                .lifecycle
                .inspect_status(&id)
                .await
                .map_err(|e| ApiError::lifecycle("Failed to get container status", e))?;
            Ok(Json(json!({
                "ok": true,
                "status": status.status,
                "detail": status.detail,
            })))
        }
        "checkVncStatus" => {
            let id = required(body.container_id, "Container ID is required")?;
            let ready = state.lifecycle.check_readiness(&id).await;
            Ok(Json(json!({ "ok": true, "ready": ready })))
        }
        "listDockerfiles" => {
            let recipes = state
                .builds
                .list_recipes()
                .await
                .map_err(|e| ApiError::build("Failed to list Dockerfiles", e))?;
            Ok(Json(json!({ "ok": true, "dockerfiles": recipes })))
        }
        "executeCommand" => {
            let command = body.command.unwrap_or_default();
            let output = state
                .lifecycle
                .execute_command(&command)
                .await
                .map_err(|e| ApiError::lifecycle("Failed to execute command", e))?;
            Ok(Json(json!({ "ok": true, "output": output })))
        }
        _ => Err(ApiError::bad_request("Invalid action")),
    }
}

// -- Docker streams --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerStreamParams {
    pub build_id: Option<String>,
    pub status_id: Option<String>,
    pub container_id: Option<String>,
}

async fn docker_stream(
    _auth: StreamAuth,
    State(state): State<AppState>,
    Query(params): Query<DockerStreamParams>,
) -> ApiResult<Response> {
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    match (
        non_empty(params.build_id),
        non_empty(params.status_id),
        non_empty(params.container_id),
    ) {
        (Some(build_id), _, _) => Ok(build_stream(&state, &build_id).into_response()),
        (None, Some(_), Some(container_id)) => {
            Ok(status_stream(&state, &container_id).await.into_response())
        }
        _ => Err(ApiError::bad_request("Missing required parameters")),
    }
}

/// Progress of one build. An id that names no build follows every build
/// instead, so a client may connect before triggering one.
fn build_stream(state: &AppState, build_id: &str) -> EventStream {
    let sub = state.builds.subscribe();
    let guard = ObserverGuard::open("build", build_id);

    match state.builds.snapshot(build_id) {
        Some(snap) => {
            let finished = snap.status.is_terminal();
            let seen = snap.seq;
            let id = snap.build_id.clone();
            relay(
                state,
                vec![snapshot_event(&snap)],
                finished,
                sub,
                guard,
                move |event: BuildEvent| {
                    if event.build_id != id || event.seq <= seen {
                        Step::Skip
                    } else if event.status.is_terminal() {
                        Step::Last(data_event(&event))
                    } else {
                        Step::Send(data_event(&event))
                    }
                },
            )
        }
        None => {
            let opening = match state.builds.latest() {
                Some(latest) => snapshot_event(&latest),
                None => snapshot_event(&json!({ "status": "idle" })),
            };
            relay(
                state,
                vec![opening],
                false,
                sub,
                guard,
                |event: BuildEvent| Step::Send(data_event(&event)),
            )
        }
    }
}

async fn status_stream(state: &AppState, container_id: &str) -> EventStream {
    let sub = state.poller.watch(container_id);
    let guard = ObserverGuard::open("status", container_id);

    let current = match state.lifecycle.inspect_status(container_id).await {
        Ok(status) => StatusEvent::from(status),
        Err(e) => StatusEvent {
            status: ContainerState::Error,
            detail: format!("Error: {e}"),
            timestamp: Utc::now(),
        },
    };
    relay(
        state,
        vec![snapshot_event(&current)],
        false,
        sub,
        guard,
        |event: StatusEvent| Step::Send(data_event(&event)),
    )
}

// -- Model artifacts --

async fn model_health(_auth: ControlAuth, State(state): State<AppState>) -> Json<Value> {
    let healthy = state.downloads.check_health().await;
    Json(json!({ "ok": true, "healthy": healthy }))
}

async fn model_list(_auth: ControlAuth, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let models = state
        .downloads
        .refresh()
        .await
        .map_err(|e| ApiError::download("Failed to list models", e))?;
    Ok(Json(json!({ "ok": true, "models": models })))
}

#[derive(Debug, Deserialize)]
pub struct PullBody {
    pub name: Option<String>,
}

fn ticket_label(ticket: DownloadTicket) -> &'static str {
    match ticket {
        DownloadTicket::Started => "started",
        DownloadTicket::AlreadyInProgress => "already_in_progress",
        DownloadTicket::AlreadyReady => "already_ready",
    }
}

async fn pull_model(
    _auth: ControlAuth,
    State(state): State<AppState>,
    body: Result<Json<PullBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let name = required(body.name, "Model name is required")?;
    let ticket = state
        .downloads
        .request_download(&name)
        .await
        .map_err(|e| ApiError::download("Failed to pull model", e))?;
    Ok(Json(json!({
        "ok": true,
        "model": name,
        "status": ticket_label(ticket),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStreamParams {
    pub model_id: Option<String>,
}

/// Download progress of one artifact, starting or joining its download.
async fn pull_stream(
    _auth: StreamAuth,
    State(state): State<AppState>,
    Query(params): Query<ModelStreamParams>,
) -> ApiResult<EventStream> {
    let name = required(params.model_id, "Model ID is required")?;
    let sub = state.downloads.subscribe(&name);
    let guard = ObserverGuard::open("download", &name);

    if let Err(e) = state.downloads.request_download(&name).await {
        let failed = ArtifactState::failed(&name, e.to_string());
        return Ok(relay(
            &state,
            vec![snapshot_event(&failed)],
            true,
            sub,
            guard,
            |_: ArtifactState| Step::Skip,
        ));
    }

    let snap = state
        .downloads
        .snapshot(&name)
        .unwrap_or_else(|| ArtifactState::failed(&name, "Unknown model"));
    let finished = snap.status.is_terminal();
    let seen = snap.revision;
    Ok(relay(
        &state,
        vec![snapshot_event(&snap)],
        finished,
        sub,
        guard,
        move |s: ArtifactState| {
            if s.revision <= seen {
                Step::Skip
            } else if s.status.is_terminal() {
                Step::Last(data_event(&s))
            } else {
                Step::Send(data_event(&s))
            }
        },
    ))
}

/// Status transitions of one artifact without starting a download.
///
/// The installed list is re-checked every poll interval, so artifacts
/// installed or removed outside this service still reach the observer.
async fn model_status_stream(
    _auth: StreamAuth,
    State(state): State<AppState>,
    Query(params): Query<ModelStreamParams>,
) -> ApiResult<EventStream> {
    let name = required(params.model_id, "Model ID is required")?;
    let sub = state.downloads.subscribe(&name);
    let snap = state
        .downloads
        .status(&name)
        .await
        .map_err(|e| ApiError::download("Failed to get model status", e))?;
    let mut guard = ObserverGuard::open("artifact", &name);
    guard.attach(spawn_installed_check(&state, &name));

    let seen = snap.revision;
    Ok(relay(
        &state,
        vec![snapshot_event(&snap)],
        false,
        sub,
        guard,
        move |s: ArtifactState| {
            if s.revision <= seen {
                Step::Skip
            } else {
                Step::Send(data_event(&s))
            }
        },
    ))
}

/// Reconcile `name` against the installed list on every poll tick. Changes
/// reach observers through the artifact's topic.
fn spawn_installed_check(state: &AppState, name: &str) -> AbortHandle {
    let downloads = state.downloads.clone();
    let every = state.poll_interval;
    let name = name.to_string();
    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = downloads.reconcile(&name).await {
                debug!(artifact = %name, error = %e, "installed check failed");
            }
        }
    });
    task.abort_handle()
}
