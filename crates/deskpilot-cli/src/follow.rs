//! Stream following with reconnect, and readiness waiting.

use std::time::Duration;

use anyhow::{bail, Result};
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::client::{envelope_error, GatewayClient};
use crate::retry::RetryPolicy;
use crate::sse::{SseDecoder, SseRecord};

/// Returned by a follower's record handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// `completed`/`ready`/`error`: nothing follows on that stream.
pub fn is_terminal_status(status: &str) -> bool {
    matches!(status, "completed" | "ready" | "error")
}

enum Attempt {
    Stopped,
    /// Stream ended or broke; carries the failure if any
    Lost(Option<anyhow::Error>),
}

/// Follow `path` until the handler returns [`Flow::Stop`].
///
/// A stream that ends or breaks is reopened after `policy.delay(n)`. The
/// attempt counter resets whenever a connection delivered a record, so only
/// consecutive failures count against `policy.max_attempts`. A 4xx answer
/// is never retried.
pub async fn follow<F>(
    client: &GatewayClient,
    path: &str,
    query: &[(&str, &str)],
    policy: RetryPolicy,
    mut on_record: F,
) -> Result<()>
where
    F: FnMut(&SseRecord) -> Flow,
{
    let mut attempt: u32 = 0;
    loop {
        let mut delivered = 0u64;
        let outcome = follow_once(client, path, query, &mut delivered, &mut on_record).await?;
        let failure = match outcome {
            Attempt::Stopped => return Ok(()),
            Attempt::Lost(failure) => failure,
        };

        if delivered > 0 {
            attempt = 0;
        }
        attempt += 1;
        if !policy.allows(attempt) {
            match failure {
                Some(e) => return Err(e.context(format!("Gave up on {path} after {} attempts", attempt - 1))),
                None => bail!("Gave up on {path} after {} attempts", attempt - 1),
            }
        }

        let delay = policy.delay(attempt);
        match &failure {
            Some(e) => warn!(path, attempt, delay_ms = delay.as_millis() as u64, error = %e, "stream lost, reconnecting"),
            None => info!(path, attempt, delay_ms = delay.as_millis() as u64, "stream ended, reconnecting"),
        }
        tokio::time::sleep(delay).await;
    }
}

async fn follow_once<F>(
    client: &GatewayClient,
    path: &str,
    query: &[(&str, &str)],
    delivered: &mut u64,
    on_record: &mut F,
) -> Result<Attempt>
where
    F: FnMut(&SseRecord) -> Flow,
{
    let resp = match client.open_stream(path, query).await {
        Ok(resp) => resp,
        Err(e) => return Ok(Attempt::Lost(Some(e))),
    };

    let status = resp.status();
    if status.is_client_error() {
        let body = resp.json().await.unwrap_or_else(|_| json!({}));
        return Err(envelope_error(status, &body));
    }
    if !status.is_success() {
        return Ok(Attempt::Lost(Some(anyhow::anyhow!("HTTP {}", status.as_u16()))));
    }

    let mut decoder = SseDecoder::new();
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Ok(Attempt::Lost(Some(e.into()))),
        };
        for record in decoder.feed(&chunk) {
            *delivered += 1;
            if record.is_keepalive() {
                debug!(path, "keepalive");
                continue;
            }
            if on_record(&record) == Flow::Stop {
                return Ok(Attempt::Stopped);
            }
        }
    }
    Ok(Attempt::Lost(None))
}

/// Poll `checkVncStatus` until it reports ready.
pub async fn wait_ready(
    client: &GatewayClient,
    container_id: &str,
    attempts: u32,
    interval: Duration,
) -> Result<bool> {
    for attempt in 1..=attempts {
        let resp = client
            .docker("checkVncStatus", json!({ "containerId": container_id }))
            .await?;
        if resp["ready"].as_bool() == Some(true) {
            info!(container_id, attempt, "desktop ready");
            return Ok(true);
        }
        debug!(container_id, attempt, "desktop not ready yet");
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_gateway;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(20),
            max_attempts: Some(2),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(is_terminal_status("completed"));
        assert!(is_terminal_status("ready"));
        assert!(is_terminal_status("error"));
        assert!(!is_terminal_status("building"));
        assert!(!is_terminal_status("downloading"));
    }

    #[tokio::test]
    async fn test_pull_stream_followed_to_ready() {
        let gw = spawn_gateway().await;
        let client = GatewayClient::new(&gw.base, gw.key).unwrap();

        let mut statuses = Vec::new();
        follow(
            &client,
            "/api/llm/ollama/pull",
            &[("modelId", "demo-model")],
            quick(),
            |record| {
                let status = record.status().unwrap_or_default();
                let done = is_terminal_status(&status);
                statuses.push(status);
                if done {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(statuses.last().map(String::as_str), Some("ready"));
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        let gw = spawn_gateway().await;
        let client = GatewayClient::new(&gw.base, gw.key).unwrap();
        let err = follow(&client, "/api/docker", &[], quick(), |_| Flow::Continue)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Missing required parameters"));
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_up() {
        let client = GatewayClient::new("http://127.0.0.1:1", "k").unwrap();
        let err = follow(&client, "/api/docker", &[("buildId", "x")], quick(), |_| Flow::Continue)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Gave up"));
    }

    #[tokio::test]
    async fn test_wait_ready_after_start() {
        let gw = spawn_gateway().await;
        let client = GatewayClient::new(&gw.base, gw.key).unwrap();

        let started = client
            .docker("startContainer", json!({ "imageName": "ghcr.io/deskpilot/desktop:latest" }))
            .await
            .unwrap();
        let id = started["id"].as_str().unwrap();
        assert!(wait_ready(&client, id, 3, Duration::from_millis(10)).await.unwrap());
        assert!(!wait_ready(&client, "deadbeef", 2, Duration::from_millis(10)).await.unwrap());
    }
}
