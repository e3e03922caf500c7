//! deskpilotd: HTTP control and streaming gateway
//!
//! Exposes the orchestration layer over HTTP:
//!
//! - `POST /api/docker` action dispatch for builds and the desktop container
//! - `GET /api/docker` build progress and container status streams (SSE)
//! - `/api/llm/ollama/*` model health, listing, downloads and their streams
//! - `GET /health` unauthenticated liveness

pub mod api;
pub mod auth;
pub mod error;
pub mod sse;
pub mod state;

pub use api::router;
pub use error::ApiError;
pub use state::AppState;
