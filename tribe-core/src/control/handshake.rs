//! Primary engine strategy: connect, launch on refusal, retry, handshake.

use std::io::ErrorKind;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use super::protocol::{self, ControlDirective, LineBuffer};
use super::{ControlError, ControlState, ControlStrategy, LinkContext};
use crate::launcher::LaunchRequest;

const READ_BUFFER: usize = 1024;

/// Control connection speaking the line protocol.
///
/// Holds the transport between calls so a connection that reached the
/// engine can still be shut down after the caller stopped waiting.
#[derive(Debug, Default)]
pub struct ControlChannel {
    transport: Option<TcpStream>,
    lines: LineBuffer,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, stream: TcpStream) {
        self.transport = Some(stream);
        self.lines = LineBuffer::new();
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    /// Announces capabilities, asks the engine to start `asset` and waits for
    /// its answer. Lines other than `PLAY` and `ERROR` are skipped; anything
    /// after the deciding line is discarded.
    ///
    /// # Errors
    /// - `ControlError::ProtocolError` - `ERROR` line, or `PLAY` without a usable URL
    /// - `ControlError::UnexpectedDisconnect` - Engine closed before deciding
    /// - `ControlError::Cancelled` - Engine closed after the exit flag was raised
    /// - `ControlError::Io` - Handshake could not be written
    pub async fn negotiate(
        &mut self,
        ctx: &LinkContext,
        asset: &str,
    ) -> Result<Url, ControlError> {
        let result = self.exchange(ctx, asset).await;
        if matches!(
            result,
            Err(ControlError::UnexpectedDisconnect | ControlError::Io { .. })
        ) {
            self.transport = None;
        }
        result
    }

    async fn exchange(&mut self, ctx: &LinkContext, asset: &str) -> Result<Url, ControlError> {
        let Some(stream) = self.transport.as_mut() else {
            return Err(ControlError::UnexpectedDisconnect);
        };

        ctx.enter_state(ControlState::AwaitingPlay);
        let hello = protocol::handshake(&ctx.config.capabilities, asset);
        stream
            .write_all(hello.as_bytes())
            .await
            .map_err(|e| ControlError::Io {
                reason: format!("handshake write failed: {e}"),
            })?;

        let mut buffer = [0u8; READ_BUFFER];
        loop {
            let read = match stream.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => {
                    tracing::debug!("Control read failed: {}", e);
                    0
                }
            };

            if read == 0 {
                if let Some(outcome) = self.lines.finish().and_then(|line| interpret(&line)) {
                    return outcome;
                }
                return Err(if ctx.exit.is_set() {
                    ControlError::Cancelled
                } else {
                    ControlError::UnexpectedDisconnect
                });
            }

            for line in self.lines.push(&buffer[..read]) {
                if let Some(outcome) = interpret(&line) {
                    return outcome;
                }
            }
        }
    }

    /// Sends `SHUTDOWN` and closes. Only the first call after attaching
    /// does anything.
    pub async fn send_shutdown(&mut self) -> bool {
        let Some(mut stream) = self.transport.take() else {
            return false;
        };

        let directive = ControlDirective::Shutdown.encode();
        if let Err(e) = stream.write_all(directive.as_bytes()).await {
            tracing::debug!("Could not deliver SHUTDOWN to engine: {}", e);
        }
        let _ = stream.shutdown().await;
        true
    }

    pub fn close(&mut self) {
        self.transport = None;
    }
}

fn interpret(line: &str) -> Option<Result<Url, ControlError>> {
    match ControlDirective::parse(line) {
        ControlDirective::Play(url) => Some(Url::parse(&url).map_err(|e| {
            ControlError::ProtocolError {
                message: format!("unusable PLAY url {url:?}: {e}"),
            }
        })),
        ControlDirective::Error(message) => Some(Err(ControlError::ProtocolError {
            message: if message.is_empty() {
                "ERROR".to_string()
            } else {
                message
            },
        })),
        other => {
            tracing::trace!("Ignoring control line {:?}", other);
            None
        }
    }
}

/// Strategy for the shared engine on the primary control port.
#[derive(Debug)]
pub struct HandshakeStrategy {
    asset: String,
    channel: ControlChannel,
}

impl HandshakeStrategy {
    pub fn new(asset: &str) -> Self {
        Self {
            asset: asset.to_string(),
            channel: ControlChannel::new(),
        }
    }

    async fn launch_and_wait(&self, ctx: &LinkContext, address: &str) -> Result<(), ControlError> {
        let refusal = ControlError::ConnectionRefused {
            address: address.to_string(),
        };

        let retries = ctx.retries();
        if let Some(limit) = ctx.config.max_connect_retries {
            if retries >= limit {
                tracing::warn!("{} and retry limit {} reached", refusal, limit);
                return Err(ControlError::RetriesExhausted {
                    attempts: retries + 1,
                });
            }
        }

        tracing::debug!("{}, launching engine", refusal);
        ctx.enter_state(ControlState::Launching);
        ctx.launcher
            .launch(&LaunchRequest::Primary {
                debug: ctx.config.debug,
            })
            .await
            .map_err(|e| ControlError::EngineLaunchFailure {
                reason: e.to_string(),
            })?;

        ctx.ensure_running()?;
        ctx.record_retry();
        ctx.enter_state(ControlState::RetryWait);
        tokio::time::sleep(ctx.config.retry_backoff).await;
        Ok(())
    }
}

#[async_trait]
impl ControlStrategy for HandshakeStrategy {
    async fn establish(&mut self, ctx: &LinkContext) -> Result<Url, ControlError> {
        let address = format!("{}:{}", ctx.config.host, ctx.config.primary_port);

        while !self.channel.is_attached() {
            ctx.ensure_running()?;
            ctx.enter_state(ControlState::Connecting);

            match TcpStream::connect(address.as_str()).await {
                Ok(stream) => {
                    tracing::debug!("Control connection established to {}", address);
                    self.channel.attach(stream);
                }
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    self.launch_and_wait(ctx, &address).await?;
                }
                Err(e) => {
                    return Err(ControlError::Io {
                        reason: format!("{address}: {e}"),
                    });
                }
            }
        }

        self.channel.negotiate(ctx, &self.asset).await
    }

    async fn shutdown(&mut self) -> bool {
        self.channel.send_shutdown().await
    }

    fn close(&mut self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::EngineConfig;
    use crate::control::ExitFlag;
    use crate::test_mocks::MockLauncher;

    fn context(port: u16, launcher: MockLauncher) -> LinkContext {
        let config = EngineConfig {
            primary_port: port,
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        LinkContext::new(config, Arc::new(launcher), ExitFlag::new())
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Engine that reads the handshake, answers with `reply` and then waits
    /// for the client to hang up. Returns every line the client sent.
    async fn scripted_engine(listener: TcpListener, reply: &'static str) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut received = Vec::new();

        while received.len() < 2 {
            match lines.next_line().await.unwrap() {
                Some(line) => received.push(line),
                None => return received,
            }
        }

        writer.write_all(reply.as_bytes()).await.unwrap();
        if reply.is_empty() {
            return received;
        }

        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line);
        }
        received
    }

    #[tokio::test]
    async fn test_play_reply_yields_data_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let engine = tokio::spawn(scripted_engine(
            listener,
            "INFO warming up\r\nPLAY http://127.0.0.1:6878/stream\r\n",
        ));

        let launcher = MockLauncher::new();
        let ctx = context(port, launcher.clone());
        let mut strategy = HandshakeStrategy::new("http://tracker.example/a.torrent");

        let url = strategy.establish(&ctx).await.unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:6878/stream");
        assert_eq!(ctx.status().state, ControlState::AwaitingPlay);
        assert_eq!(launcher.launch_count(), 0);

        assert!(strategy.shutdown().await);
        assert!(!strategy.shutdown().await);

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
    async fn test_error_reply_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(scripted_engine(listener, "ERROR no such asset\r\nPLAY http://x/\r\n"));

        let ctx = context(port, MockLauncher::new());
        let mut strategy = HandshakeStrategy::new("asset");

        let result = strategy.establish(&ctx).await;
        assert_eq!(
            result,
            Err(ControlError::ProtocolError {
                message: "no such asset".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_silent_close_is_unexpected_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(scripted_engine(listener, ""));

        let ctx = context(port, MockLauncher::new());
        let mut strategy = HandshakeStrategy::new("asset");

        assert_eq!(
            strategy.establish(&ctx).await,
            Err(ControlError::UnexpectedDisconnect)
        );
        assert!(!strategy.shutdown().await);
    }

    #[tokio::test]
    async fn test_refusal_launches_and_retries() {
        let port = unused_port().await;
        let launcher = MockLauncher::with_hook(move |_request| async move {
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::spawn(scripted_engine(listener, "PLAY http://127.0.0.1:6878/v\r\n"));
        });

        let ctx = context(port, launcher.clone());
        let mut strategy = HandshakeStrategy::new("asset");

        let url = strategy.establish(&ctx).await.unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:6878/v");
        assert_eq!(ctx.retries(), 1);
        assert_eq!(
            launcher.requests(),
            vec![LaunchRequest::Primary { debug: false }]
        );
    }

    #[tokio::test]
    async fn test_launch_failure_is_fatal() {
        let port = unused_port().await;
        let launcher = MockLauncher::new_with_launch_failure();
        let ctx = context(port, launcher.clone());
        let mut strategy = HandshakeStrategy::new("asset");

        let result = strategy.establish(&ctx).await;
        assert!(matches!(
            result,
            Err(ControlError::EngineLaunchFailure { .. })
        ));
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(ctx.retries(), 0);
    }

    #[tokio::test]
    async fn test_retry_limit_reached() {
        let port = unused_port().await;
        let launcher = MockLauncher::new();
        let mut ctx = context(port, launcher.clone());
        ctx.config.max_connect_retries = Some(2);
        let mut strategy = HandshakeStrategy::new("asset");

        let result = strategy.establish(&ctx).await;
        assert_eq!(result, Err(ControlError::RetriesExhausted { attempts: 3 }));
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_separates_launch_attempts() {
        let port = unused_port().await;
        let launcher = MockLauncher::new();
        let mut ctx = context(port, launcher.clone());
        ctx.config.retry_backoff = Duration::from_secs(1);
        ctx.config.max_connect_retries = Some(3);
        let mut strategy = HandshakeStrategy::new("asset");

        let started = tokio::time::Instant::now();
        let result = strategy.establish(&ctx).await;

        assert_eq!(result, Err(ControlError::RetriesExhausted { attempts: 4 }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "waited {elapsed:?}");
    }

    #[tokio::test]
    async fn test_exit_flag_stops_retrying() {
        let port = unused_port().await;
        let ctx = context(port, MockLauncher::new());
        ctx.exit.set();
        let mut strategy = HandshakeStrategy::new("asset");

        assert_eq!(
            strategy.establish(&ctx).await,
            Err(ControlError::Cancelled)
        );
    }
}
