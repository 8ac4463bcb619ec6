//! Playback sessions.
//!
//! A [`Session`] is one playback request: a parsed descriptor plus the
//! collaborators it needs. Opening it consumes it and spawns an actor that
//! drives the control link, picks the forwarder and relays the stream to
//! the consumer. The returned [`SessionHandle`] cancels, shuts down and
//! observes the session.

pub mod actor;
pub mod commands;
pub mod handle;

use std::sync::Arc;

pub use commands::SessionCommand;
pub use handle::SessionHandle;

use crate::config::TribeConfig;
use crate::consumer::{SessionId, StreamConsumer};
use crate::launcher::{EngineLauncher, LaunchRegistry, ProcessLauncher};
use crate::metadata::{ShadowUris, ShadowedResponse};
use crate::source::{SourceDescriptor, SourceError};
use crate::upstream::{DataFetcher, HttpFetcher};

/// Collaborators shared by every session of a process.
///
/// The launch registry lives here so alternate engines started by one
/// session are seen by the next.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<TribeConfig>,
    pub launcher: Arc<dyn EngineLauncher>,
    pub fetcher: Arc<dyn DataFetcher>,
    pub registry: LaunchRegistry,
}

impl SessionContext {
    pub fn new(
        config: TribeConfig,
        launcher: Arc<dyn EngineLauncher>,
        fetcher: Arc<dyn DataFetcher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            launcher,
            fetcher,
            registry: LaunchRegistry::new(),
        }
    }

    /// Context that starts real engine processes and fetches over HTTP.
    ///
    /// # Errors
    /// - `TribeError::Configuration` - HTTP client settings were rejected
    pub fn production(config: TribeConfig) -> crate::Result<Self> {
        let launcher = Arc::new(ProcessLauncher::new(&config.engine));
        let fetcher = Arc::new(HttpFetcher::new(&config.network)?);
        Ok(Self::new(config, launcher, fetcher))
    }

    /// Parses `descriptor` into a session ready to open.
    ///
    /// # Errors
    /// - `SourceError::MissingPrimary` - Descriptor names no asset
    /// - `SourceError::InvalidFallback` - Fallback mirror is not a valid URL
    pub fn session(&self, descriptor: &str) -> Result<Session, SourceError> {
        let source = SourceDescriptor::parse(descriptor)?;
        Ok(Session::new(source, self.clone()))
    }
}

/// One playback request, not yet opened.
pub struct Session {
    id: SessionId,
    source: SourceDescriptor,
    ctx: SessionContext,
    shadow: Option<ShadowedResponse>,
    uris: Option<ShadowUris>,
}

impl Session {
    pub fn new(source: SourceDescriptor, ctx: SessionContext) -> Self {
        let (shadow, uris) = if source.metadata_mode() {
            (Some(ShadowedResponse::new()), Some(ShadowUris::generate()))
        } else {
            (None, None)
        };

        Self {
            id: SessionId::new(),
            source,
            ctx,
            shadow,
            uris,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    /// Starts the session, relaying the stream to `consumer`.
    ///
    /// Every outcome, including failure to reach any engine, reaches the
    /// consumer as a start followed by a stop.
    pub fn open(self, consumer: Arc<dyn StreamConsumer>) -> SessionHandle {
        tracing::info!(
            "Opening {} via {} backend",
            self.source,
            self.source.backend().label()
        );
        actor::spawn_session(self, consumer)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::consumer::{RequestIdentity, StopStatus};
    use crate::control::ControlState;
    use crate::forward::ForwarderKind;
    use crate::metadata::ResponseMetadata;
    use crate::test_mocks::{ConsumerEvent, MockLauncher, RecordingConsumer, ScriptedFetcher};

    const DATA_URL: &str = "http://127.0.0.1:6878/stream";
    const WAIT: Duration = Duration::from_secs(5);

    fn context(port: u16, launcher: MockLauncher, fetcher: ScriptedFetcher) -> SessionContext {
        let mut config = TribeConfig::for_testing();
        config.engine.primary_port = port;
        config.engine.alternate_port = port;
        SessionContext::new(config, Arc::new(launcher), Arc::new(fetcher))
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Engine answering every handshake with `PLAY <DATA_URL>`; returns the
    /// lines received on the first connection.
    async fn playing_engine(listener: TcpListener) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut received = Vec::new();

        while let Ok(Some(line)) = lines.next_line().await {
            let is_start = line.starts_with("START");
            received.push(line);
            if is_start {
                writer
                    .write_all(format!("PLAY {DATA_URL}\r\n").as_bytes())
                    .await
                    .unwrap();
            }
        }
        received
    }

    #[tokio::test]
    async fn test_play_streams_through_direct_forwarder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let engine = tokio::spawn(playing_engine(listener));

        let fetcher = ScriptedFetcher::new();
        fetcher.respond(
            DATA_URL,
            200,
            &[("content-length", "6")],
            b"stream",
            2,
            StopStatus::Success,
        );
        let ctx = context(port, MockLauncher::new(), fetcher);
        let consumer = RecordingConsumer::new();

        let session = ctx.session("tribe://http://tracker.example/a.torrent").unwrap();
        let handle = session.open(Arc::new(consumer.clone()));

        assert_eq!(consumer.wait_for_stop(WAIT).await, Some(StopStatus::Success));
        assert_eq!(handle.forwarder_kind(), Some(ForwarderKind::Direct));
        assert_eq!(handle.state(), ControlState::Playing);
        assert_eq!(consumer.body(), b"stream");

        handle.shutdown().await;
        handle.shutdown().await;

        let received = engine.await.unwrap();
        assert_eq!(
            received,
            vec![
                "SUPPORTS VIDEVENT_START",
                "START http://tracker.example/a.torrent",
                "SHUTDOWN"
            ]
        );
    }

    #[tokio::test]
    async fn test_launch_failure_reaches_consumer_as_failed_open() {
        let port = unused_port().await;
        let launcher = MockLauncher::new_with_launch_failure();
        let ctx = context(port, launcher.clone(), ScriptedFetcher::new());
        let consumer = RecordingConsumer::new();

        let handle = ctx
            .session("http://tracker.example/a.torrent")
            .unwrap()
            .open(Arc::new(consumer.clone()));

        assert!(matches!(
            consumer.wait_for_stop(WAIT).await,
            Some(StopStatus::Failure { .. })
        ));
        assert_eq!(consumer.start_count(), 1);
        assert_eq!(consumer.data_count(), 0);
        assert_eq!(handle.state(), ControlState::Errored);
        assert_eq!(handle.forwarder_kind(), Some(ForwarderKind::Direct));
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_retries_stops_launching() {
        let port = unused_port().await;
        let launcher = MockLauncher::new();
        let ctx = context(port, launcher.clone(), ScriptedFetcher::new());
        let consumer = RecordingConsumer::new();

        let handle = ctx
            .session("http://tracker.example/a.torrent")
            .unwrap()
            .open(Arc::new(consumer.clone()));

        while handle.retry_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.cancel().await;
        handle.cancel().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let launches = launcher.launch_count();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(launcher.launch_count(), launches);
        assert!(consumer.events().is_empty());
        assert_eq!(handle.forwarder_kind(), None);
        assert_eq!(handle.state(), ControlState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_metadata_mode_shadows_engine_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(playing_engine(listener));

        let fetcher = ScriptedFetcher::new();
        fetcher.respond(
            DATA_URL,
            200,
            &[("content-type", "application/xml")],
            b"<x/>",
            4,
            StopStatus::failure("engine hung up"),
        );
        let ctx = context(port, MockLauncher::new(), fetcher);
        let consumer = RecordingConsumer::new();

        let session = ctx.session("http://tracker.example/a.torrent;xmlhttp").unwrap();
        let session_id = session.id();
        let handle = session.open(Arc::new(consumer.clone()));

        assert!(handle.is_metadata_mode());
        assert!(handle.presented_uri().unwrap().ends_with("/fakeurl.html"));
        assert!(handle.original_uri().unwrap().ends_with("/fakeorigurl.html"));

        assert_eq!(consumer.wait_for_stop(WAIT).await, Some(StopStatus::Success));
        assert_eq!(handle.forwarder_kind(), Some(ForwarderKind::MetadataShadowed));
        assert_eq!(handle.content_type().as_deref(), Some("application/xml"));
        assert_eq!(handle.response_status(), Some(200));
        assert_eq!(handle.request_method(), "GET");
        assert!(matches!(
            consumer.events()[0],
            ConsumerEvent::Start { request: RequestIdentity::Session(id), .. } if id == session_id
        ));
    }

    #[tokio::test]
    async fn test_plain_session_reports_no_headers() {
        let ctx = context(unused_port().await, MockLauncher::new(), ScriptedFetcher::new());
        let handle = ctx
            .session("http://tracker.example/a.torrent")
            .unwrap()
            .open(Arc::new(RecordingConsumer::new()));

        assert!(!handle.is_metadata_mode());
        assert_eq!(handle.response_header("content-type"), None);
        assert_eq!(handle.presented_uri(), None);
        handle.cancel().await;
    }

    #[test]
    fn test_invalid_descriptor_rejected() {
        let ctx = SessionContext::new(
            TribeConfig::for_testing(),
            Arc::new(MockLauncher::new()),
            Arc::new(ScriptedFetcher::new()),
        );
        assert!(matches!(
            ctx.session("tribe://"),
            Err(SourceError::MissingPrimary { .. })
        ));
    }

    #[test]
    fn test_production_context_surfaces_client_errors() {
        let mut config = TribeConfig::for_testing();
        config.network.user_agent = "tribe\r\n";

        assert!(matches!(
            SessionContext::production(config),
            Err(crate::TribeError::Configuration { .. })
        ));
    }
}
