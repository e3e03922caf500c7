//! Runtime configuration
//!
//! Defaults describe the single managed desktop container and a local model
//! service. Every field can be overridden from the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed logical name of the managed container.
pub const CONTAINER_NAME: &str = "llm-controlled-computer";

/// Tag used for images built from a local recipe.
pub const LOCAL_IMAGE_TAG: &str = "llm-computer-local:latest";

/// VNC display port.
pub const DISPLAY_PORT: u16 = 5900;
/// Agent API port.
pub const API_PORT: u16 = 8501;
/// Browser VNC proxy port.
pub const PROXY_PORT: u16 = 6080;
/// Auxiliary service port.
pub const AUX_PORT: u16 = 8080;

/// Ports exposed by the container, bound to the same host port.
pub const SERVICE_PORTS: [u16; 4] = [DISPLAY_PORT, API_PORT, PROXY_PORT, AUX_PORT];

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeskConfig {
    /// Directory holding build recipes and their context files
    pub recipe_dir: PathBuf,
    /// Logical container name
    pub container_name: String,
    /// Host used for readiness probes
    pub probe_host: String,
    /// Provider key forwarded into the container
    #[serde(skip_serializing)]
    pub provider_api_key: Option<String>,
    /// Model service base URL
    pub model_service_url: String,
    pub display_width: u32,
    pub display_height: u32,
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub throttle_interval_ms: u64,
    /// Per-subscriber delivery buffer
    pub event_buffer: usize,
}

impl Default for DeskConfig {
    fn default() -> Self {
        DeskConfig {
            recipe_dir: PathBuf::from("data/dockerfiles"),
            container_name: CONTAINER_NAME.to_string(),
            probe_host: "127.0.0.1".to_string(),
            provider_api_key: None,
            model_service_url: "http://localhost:11434".to_string(),
            display_width: 1920,
            display_height: 1080,
            probe_timeout_ms: 1_000,
            poll_interval_ms: 5_000,
            keepalive_interval_ms: 15_000,
            throttle_interval_ms: 1_000,
            event_buffer: 256,
        }
    }
}

impl DeskConfig {
    /// Defaults overridden by `DESKPILOT_RECIPE_DIR`, `DESKPILOT_CONTAINER_NAME`,
    /// `DESKPILOT_PROBE_HOST`, `ANTHROPIC_API_KEY` and `OLLAMA_URL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("DESKPILOT_RECIPE_DIR") {
            config.recipe_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("DESKPILOT_CONTAINER_NAME") {
            config.container_name = name;
        }
        if let Ok(host) = std::env::var("DESKPILOT_PROBE_HOST") {
            config.probe_host = host;
        }
        config.provider_api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            config.model_service_url = url;
        }
        config
    }

    pub fn with_recipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recipe_dir = dir.into();
        self
    }

    /// `KEY=VALUE` environment for the desktop container.
    pub fn container_env(&self) -> Vec<String> {
        let mut env = vec![
            format!("WIDTH={}", self.display_width),
            format!("HEIGHT={}", self.display_height),
        ];
        if let Some(key) = &self.provider_api_key {
            env.push(format!("ANTHROPIC_API_KEY={key}"));
        }
        env
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_desktop_image() {
        let config = DeskConfig::default();
        assert_eq!(config.container_name, "llm-controlled-computer");
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(15));
        assert_eq!(config.container_env(), vec!["WIDTH=1920", "HEIGHT=1080"]);
    }

    #[test]
    fn test_provider_key_forwarded_but_not_serialized() {
        let config = DeskConfig {
            provider_api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        assert!(config
            .container_env()
            .contains(&"ANTHROPIC_API_KEY=sk-test".to_string()));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-test"));
    }
}
