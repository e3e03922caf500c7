//! Readiness probe contract

use async_trait::async_trait;

/// Bounded-timeout TCP connect check.
///
/// Implementations must apply their own timeout and must never fail: an
/// unreachable, refused or slow port is simply `false`.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, host: &str, port: u16) -> bool;
}
