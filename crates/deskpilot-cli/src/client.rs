//! Thin HTTP client for the gateway.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

const API_KEY_HEADER: &str = "x-api-key";

pub struct GatewayClient {
    http: Client,
    base: String,
    api_key: String,
}

impl GatewayClient {
    pub fn new(server: &str, api_key: &str) -> Result<Self> {
        let base = server.trim_end_matches('/').to_string();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            bail!("server must be an http(s) URL, got {server:?}");
        }
        let http = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(GatewayClient {
            http,
            base,
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Dispatch one `POST /api/docker` action.
    pub async fn docker(&self, action: &str, fields: Value) -> Result<Value> {
        let mut body = json!({ "action": action });
        if let (Some(body), Value::Object(fields)) = (body.as_object_mut(), fields) {
            body.extend(fields);
        }
        self.post_json("/api/docker", &body).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        debug!(path, "POST");
        let resp = self
            .http
            .post(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        read_envelope(resp).await
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        debug!(path, "GET");
        let resp = self
            .http
            .get(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        read_envelope(resp).await
    }

    /// Open an event stream. The key travels in the query string, as it
    /// does for browser clients.
    pub async fn open_stream(&self, path: &str, query: &[(&str, &str)]) -> Result<Response> {
        let mut params: Vec<(&str, &str)> = query.to_vec();
        params.push(("apiKey", self.api_key.as_str()));
        self.http
            .get(self.url(path))
            .query(&params)
            .header("accept", "text/event-stream")
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))
    }
}

/// Decode the `{ok, message, error}` envelope, failing when `ok` is false.
pub async fn read_envelope(resp: Response) -> Result<Value> {
    let status = resp.status();
    let body: Value = resp
        .json()
        .await
        .with_context(|| format!("Unreadable response (HTTP {status})"))?;
    if body.get("ok").and_then(Value::as_bool) == Some(false) || !status.is_success() {
        return Err(envelope_error(status, &body));
    }
    Ok(body)
}

pub fn envelope_error(status: StatusCode, body: &Value) -> anyhow::Error {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("request failed");
    match body.get("error").and_then(Value::as_str) {
        Some(error) => anyhow!("{message}: {error} (HTTP {})", status.as_u16()),
        None => anyhow!("{message} (HTTP {})", status.as_u16()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_gateway;

    #[test]
    fn test_rejects_non_http_server() {
        assert!(GatewayClient::new("localhost:3000", "k").is_err());
        assert!(GatewayClient::new("http://localhost:3000/", "k").is_ok());
    }

    #[test]
    fn test_envelope_error_text() {
        let err = envelope_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "ok": false, "message": "Failed to stop container", "error": "boom" }),
        );
        assert_eq!(err.to_string(), "Failed to stop container: boom (HTTP 500)");
    }

    #[tokio::test]
    async fn test_action_roundtrip_against_gateway() {
        let gw = spawn_gateway().await;
        let client = GatewayClient::new(&gw.base, gw.key).unwrap();

        let listed = client.docker("listDockerfiles", json!({})).await.unwrap();
        assert_eq!(listed["dockerfiles"], json!(["Dockerfile"]));

        let err = client
            .docker("stopContainer", json!({ "containerId": "deadbeef" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No such container: deadbeef"));
    }

    #[tokio::test]
    async fn test_wrong_key_surfaces_auth_message() {
        let gw = spawn_gateway().await;
        let client = GatewayClient::new(&gw.base, "wrong").unwrap();
        let err = client.get_json("/api/llm/ollama/health").await.unwrap_err();
        assert!(err.to_string().contains("Authentication required"));
    }
}
