//! Deskpilot-Adapters: real collaborators behind the deskpilot contracts
//!
//! ## Layer 1 - Collaborator Adapters
//!
//! Focus: translate engine-neutral calls into Docker Engine API requests,
//! Ollama HTTP requests and plain TCP connects, and map their failures onto
//! `EngineError`.
//!
//! ## Key Components
//!
//! - `DockerEngine`: `ContainerEngine` over `bollard` (local socket)
//! - `OllamaClient`: `ModelService` over `reqwest` with NDJSON pull decoding
//! - `TcpProbe`: `PortProbe` with a bounded connect timeout

pub mod docker;
mod error;
pub mod ollama;
pub mod probe;

pub use docker::{pack_context, DockerEngine};
pub use ollama::{decode_ndjson, OllamaClient, DEFAULT_OLLAMA_URL};
pub use probe::TcpProbe;
