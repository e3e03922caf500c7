//! Ollama model service client
//!
//! Uses the HTTP API of a local Ollama instance:
//! - `GET /` for liveness
//! - `GET /api/tags` for installed models
//! - `POST /api/pull` for a newline-delimited JSON progress feed

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deskpilot_engine::{
    EngineError, EngineResult, InstalledModel, ModelService, PullProgress, PullStream,
};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::from_http;

/// Address of a locally running Ollama.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<InstalledModel>,
}

/// `ModelService` for an Ollama-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl OllamaClient {
    /// Create a client for `base_url` (trailing slash is ignored).
    pub fn new(base_url: &str) -> EngineResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("deskpilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Unavailable(format!("http client: {e}")))?;

        Ok(OllamaClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ModelService for OllamaClient {
    async fn health(&self) -> bool {
        match self
            .http_client
            .get(self.url("/"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "model service health check failed");
                false
            }
        }
    }

    async fn list_installed(&self) -> EngineResult<Vec<InstalledModel>> {
        let tags: TagsResponse = self
            .http_client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(from_http)?
            .error_for_status()
            .map_err(from_http)?
            .json()
            .await
            .map_err(from_http)?;
        Ok(tags.models)
    }

    async fn pull(&self, name: &str) -> EngineResult<PullStream> {
        info!(artifact = %name, "opening pull feed");
        let response = self
            .http_client
            .post(self.url("/api/pull"))
            .json(&serde_json::json!({ "name": name, "stream": true }))
            .send()
            .await
            .map_err(from_http)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            warn!(artifact = %name, status, "pull rejected");
            return Err(EngineError::Api { status, message });
        }

        Ok(decode_ndjson(Box::pin(response.bytes_stream())).boxed())
    }
}

struct LineBuffer<S> {
    inner: S,
    buf: Vec<u8>,
    done: bool,
}

/// Split a chunked byte stream into newline-delimited `PullProgress` records.
///
/// Chunk boundaries need not align with lines. A transport error is yielded
/// once and ends the stream; a trailing line without a newline is still decoded.
pub fn decode_ndjson<S, E>(inner: S) -> impl Stream<Item = EngineResult<PullProgress>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let state = LineBuffer {
        inner,
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let record = serde_json::from_str::<PullProgress>(text).map_err(EngineError::from);
                return Some((record, st));
            }

            if st.done {
                let rest = std::mem::take(&mut st.buf);
                let text = String::from_utf8_lossy(&rest).trim().to_string();
                if text.is_empty() {
                    return None;
                }
                let record = serde_json::from_str::<PullProgress>(&text).map_err(EngineError::from);
                return Some((record, st));
            }

            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(EngineError::Unavailable(e.to_string())), st));
                }
                None => st.done = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, String>> + Send + Unpin {
        let owned: Vec<Result<Bytes, String>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn test_decode_lines_split_across_chunks() {
        let feed = chunks(&[
            "{\"status\":\"pulling manifest\"}\n{\"status\":\"down",
            "loading\",\"total\":10,\"completed\":5}\n",
            "{\"status\":\"success\"}",
        ]);
        let records: Vec<_> = decode_ndjson(feed).collect().await;

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].as_ref().unwrap().status, "pulling manifest");
        assert_eq!(records[1].as_ref().unwrap().percent(), Some(50));
        assert!(records[2].as_ref().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_decode_skips_blank_lines() {
        let feed = chunks(&["\n\n{\"status\":\"success\"}\n\n"]);
        let records: Vec<_> = decode_ndjson(feed).collect().await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let feed = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"status\":\"pulling\"}\n")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"{\"status\":\"success\"}\n")),
        ]);
        let records: Vec<_> = decode_ndjson(feed).collect().await;

        assert_eq!(records.len(), 2);
        assert!(matches!(records[1], Err(EngineError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_garbage_line_is_malformed() {
        let feed = chunks(&["not json\n"]);
        let records: Vec<_> = decode_ndjson(feed).collect().await;
        assert!(matches!(records[0], Err(EngineError::Malformed(_))));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/").unwrap();
        assert_eq!(client.url("/api/tags"), "http://localhost:11434/api/tags");
    }
}
