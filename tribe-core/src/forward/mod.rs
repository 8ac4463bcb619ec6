//! Forwarders relay upstream data connections to the consumer.
//!
//! Exactly one forwarder serves a session. It is chosen once the control
//! link produced a data URL:
//!
//! - metadata mode: [`MetadataShadowedForwarder`]
//! - no fallback mirror: [`DirectForwarder`]
//! - otherwise: [`FallbackForwarder`], which can finish the stream from the mirror

pub mod direct;
pub mod fallback;
pub mod shadowed;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use direct::DirectForwarder;
pub use fallback::FallbackForwarder;
pub use shadowed::MetadataShadowedForwarder;

use crate::consumer::{SessionId, StreamConsumer};
use crate::metadata::ShadowedResponse;
use crate::source::SourceDescriptor;
use crate::upstream::{DataFetcher, UpstreamConnection, UpstreamEvent};

/// Forwarding failures. None of these reach the consumer directly; they
/// decide between failover and a failed stop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    #[error("Engine stopped after {delivered} of {expected} bytes")]
    StreamIncomplete { delivered: u64, expected: u64 },

    #[error("Fallback mirror answered HTTP {status} to a range request")]
    FailoverRejected { status: u16 },

    #[error("Fallback mirror unreachable: {reason}")]
    FailoverConnection { reason: String },
}

/// Whether the forwarder has delivered its final stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    Continue,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderKind {
    Direct,
    FallbackCapable,
    MetadataShadowed,
}

impl fmt::Display for ForwarderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwarderKind::Direct => write!(f, "direct"),
            ForwarderKind::FallbackCapable => write!(f, "fallback-capable"),
            ForwarderKind::MetadataShadowed => write!(f, "metadata-shadowed"),
        }
    }
}

/// Relays events from the forwarder's current upstream to the consumer.
#[async_trait]
pub trait Forwarder: Send {
    fn kind(&self) -> ForwarderKind;

    /// Next event from whichever upstream is active, or `None` when nothing
    /// more will arrive. Cancel-safe.
    async fn next_event(&mut self) -> Option<UpstreamEvent>;

    /// Handles one event. Events from connections the forwarder no longer
    /// reads from are dropped.
    async fn relay(&mut self, event: UpstreamEvent, consumer: &dyn StreamConsumer) -> Relay;

    /// Closes every open upstream connection. Nothing is sent to the consumer.
    fn close(&mut self);

    /// Highest absolute offset delivered to the consumer.
    fn delivered(&self) -> u64;
}

/// Picks the forwarder variant for `source`.
pub fn select_forwarder(source: &SourceDescriptor) -> ForwarderKind {
    if source.metadata_mode() {
        ForwarderKind::MetadataShadowed
    } else if source.fallback().is_none() {
        ForwarderKind::Direct
    } else {
        ForwarderKind::FallbackCapable
    }
}

/// Builds the forwarder for `source` around the engine's data connection.
pub fn build_forwarder(
    source: &SourceDescriptor,
    engine: UpstreamConnection,
    fetcher: Arc<dyn DataFetcher>,
    session: SessionId,
    shadow: Option<ShadowedResponse>,
) -> Box<dyn Forwarder> {
    match (select_forwarder(source), source.fallback()) {
        (ForwarderKind::MetadataShadowed, _) => Box::new(MetadataShadowedForwarder::new(
            engine,
            session,
            shadow.unwrap_or_default(),
        )),
        (ForwarderKind::FallbackCapable, Some(fallback)) => {
            Box::new(FallbackForwarder::new(engine, fallback.clone(), fetcher))
        }
        _ => Box::new(DirectForwarder::new(engine)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_order() {
        let metadata = SourceDescriptor::parse("a.torrent|http://m.example/v;xmlhttp").unwrap();
        assert_eq!(select_forwarder(&metadata), ForwarderKind::MetadataShadowed);

        let direct = SourceDescriptor::parse("a.torrent").unwrap();
        assert_eq!(select_forwarder(&direct), ForwarderKind::Direct);

        let fallback = SourceDescriptor::parse("a.torrent|http://m.example/v").unwrap();
        assert_eq!(select_forwarder(&fallback), ForwarderKind::FallbackCapable);
    }

    #[test]
    fn test_error_messages() {
        let incomplete = ForwardError::StreamIncomplete {
            delivered: 400,
            expected: 1000,
        };
        assert_eq!(incomplete.to_string(), "Engine stopped after 400 of 1000 bytes");
        assert_eq!(
            ForwardError::FailoverRejected { status: 404 }.to_string(),
            "Fallback mirror answered HTTP 404 to a range request"
        );
    }
}
