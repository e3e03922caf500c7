//! Deskpilot-Engine: collaborator contracts for the deskpilot orchestrator
//!
//! This crate defines the narrow interfaces the orchestration layer consumes
//! from the outside world. Nothing here talks to Docker or Ollama directly;
//! real implementations live in `deskpilot-adapters`.
//!
//! ## Layer 0 - Collaborator Contracts
//!
//! Focus: a stable, engine-agnostic vocabulary for containers, model
//! artifacts and port probes.
//!
//! ## Key Components
//!
//! - `ContainerEngine`: build / create / start / stop / remove / inspect / exec
//! - `ModelService`: health, installed listing, pull progress feed
//! - `PortProbe`: bounded TCP connect check
//! - `fakes`: in-memory implementations for tests

pub mod container;
mod error;
pub mod fakes;
pub mod model;
pub mod probe;

pub use container::{
    BuildProgress, BuildRequest, ContainerEngine, ContainerInspect, ContainerSpec,
    ContainerSummary, EngineState,
};
pub use error::EngineError;
pub use model::{InstalledModel, ModelService, PullProgress, PullStream};
pub use probe::PortProbe;

/// Result type for collaborator calls
pub type EngineResult<T> = std::result::Result<T, EngineError>;
