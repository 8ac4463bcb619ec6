//! Consumer-facing side of a stream.
//!
//! Whatever backend produced the bytes, the consumer sees exactly one
//! `on_start`, zero or more `on_data` calls with contiguous offsets, and one
//! `on_stop`.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::upstream::ResponseHead;

/// Identifies one upstream data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Identifies one playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0.simple())
    }
}

/// Request an event is attributed to when it reaches the consumer.
///
/// Most forwarders pass the upstream connection through. Metadata-mode
/// sessions attribute every event to the session itself so the consumer
/// only ever sees one request object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestIdentity {
    Connection(ConnectionId),
    Session(SessionId),
}

/// Terminal status of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopStatus {
    Success,
    Failure { reason: String },
}

impl StopStatus {
    pub fn failure(reason: impl Into<String>) -> Self {
        StopStatus::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StopStatus::Success)
    }
}

impl fmt::Display for StopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopStatus::Success => write!(f, "success"),
            StopStatus::Failure { reason } => write!(f, "failure ({reason})"),
        }
    }
}

/// External sink receiving the bridged stream.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Stream opened, or failed to open. Called exactly once.
    async fn on_start(&self, request: RequestIdentity, head: &ResponseHead);

    /// Bytes at absolute `offset` within the asset.
    async fn on_data(&self, request: RequestIdentity, offset: u64, data: Bytes);

    /// Stream finished. No calls follow.
    async fn on_stop(&self, request: RequestIdentity, status: StopStatus);
}
