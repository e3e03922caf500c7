//! A live gateway on an ephemeral port, backed by in-memory fakes.

use std::sync::Arc;

use deskpilot_core::config::{DISPLAY_PORT, PROXY_PORT};
use deskpilot_core::DeskConfig;
use deskpilot_engine::fakes::{MemoryEngine, MemoryModelService, StaticProbe};
use deskpilotd::{router, AppState};

pub struct TestGateway {
    pub base: String,
    pub key: &'static str,
    pub state: AppState,
    _recipes: tempfile::TempDir,
}

pub async fn spawn_gateway() -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM ubuntu:22.04\n").unwrap();

    let key = "cli-test-key";
    let config = DeskConfig::default().with_recipe_dir(dir.path());
    let state = AppState::new(
        Arc::new(MemoryEngine::new()),
        Arc::new(MemoryModelService::new()),
        Arc::new(StaticProbe::with_open(&[DISPLAY_PORT, PROXY_PORT])),
        &config,
        key,
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway {
        base: format!("http://{addr}"),
        key,
        state,
        _recipes: dir,
    }
}
