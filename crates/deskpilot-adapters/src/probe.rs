//! TCP readiness probe

use std::time::Duration;

use async_trait::async_trait;
use deskpilot_engine::PortProbe;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Connect timeout applied when none is configured.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// `PortProbe` that attempts a TCP connect within a fixed timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        TcpProbe {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        TcpProbe { timeout }
    }
}

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_open(&self, host: &str, port: u16) -> bool {
        let open = matches!(
            timeout(self.timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        );
        trace!(host, port, open, "port probe");
        open
    }
}
