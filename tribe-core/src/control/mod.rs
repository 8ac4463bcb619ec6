//! Control link to the local P2P engine.
//!
//! The link gets a data URL out of the engine, launching the engine when
//! nothing is listening. How that happens depends on the backend, so each
//! [`BackendKind`] maps to one [`ControlStrategy`] when the link is built:
//!
//! - primary engine: [`HandshakeStrategy`], line protocol with launch and retry
//! - alternate engine: [`GatewayStrategy`], launch per asset and use its HTTP gateway

pub mod gateway;
pub mod handshake;
pub mod protocol;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use url::Url;

pub use gateway::GatewayStrategy;
pub use handshake::{ControlChannel, HandshakeStrategy};
pub use protocol::{ControlDirective, LineBuffer};

use crate::config::EngineConfig;
use crate::launcher::{EngineLauncher, LaunchRegistry};
use crate::source::{BackendKind, SourceDescriptor};

/// Where the link is in getting the engine to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Connecting,
    Launching,
    RetryWait,
    AwaitingPlay,
    Playing,
    Errored,
    ShuttingDown,
}

/// Snapshot published to session handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: ControlState,
    /// Refused connections followed by a launch so far
    pub retries: u32,
}

/// Errors on the control link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Engine refused control connection at {address}")]
    ConnectionRefused { address: String },

    #[error("Engine launch failed: {reason}")]
    EngineLaunchFailure { reason: String },

    #[error("Engine reported an error: {message}")]
    ProtocolError { message: String },

    #[error("Engine closed the control connection before playback")]
    UnexpectedDisconnect,

    #[error("Engine not reachable after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Control connection failed: {reason}")]
    Io { reason: String },

    #[error("Session cancelled")]
    Cancelled,
}

impl ControlError {
    /// Whether the link handles this itself by launching and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ControlError::ConnectionRefused { .. })
    }

    /// Whether this ends the session with a failed stream.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable() && !matches!(self, ControlError::Cancelled)
    }
}

/// Session-scoped flag raised by cancel and shutdown.
///
/// Once set, no further launch or retry is attempted.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared state a strategy works against while establishing.
pub struct LinkContext {
    pub config: EngineConfig,
    pub launcher: Arc<dyn EngineLauncher>,
    pub exit: ExitFlag,
    status: watch::Sender<LinkStatus>,
}

impl LinkContext {
    pub fn new(config: EngineConfig, launcher: Arc<dyn EngineLauncher>, exit: ExitFlag) -> Self {
        let (status, _) = watch::channel(LinkStatus {
            state: ControlState::Connecting,
            retries: 0,
        });
        Self {
            config,
            launcher,
            exit,
            status,
        }
    }

    pub fn enter_state(&self, state: ControlState) {
        self.status.send_modify(|status| status.state = state);
    }

    pub fn record_retry(&self) {
        self.status.send_modify(|status| status.retries += 1);
    }

    pub fn retries(&self) -> u32 {
        self.status.borrow().retries
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    /// # Errors
    /// - `ControlError::Cancelled` - The session's exit flag is set
    pub fn ensure_running(&self) -> Result<(), ControlError> {
        if self.exit.is_set() {
            Err(ControlError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Backend-specific way of obtaining a data URL from an engine.
#[async_trait]
pub trait ControlStrategy: Send {
    /// Drives connection, launch and retry until the engine names the URL
    /// to stream from.
    ///
    /// State lives in `self` rather than the returned future, so dropping
    /// the future part-way leaves an open transport available to `shutdown`.
    async fn establish(&mut self, ctx: &LinkContext) -> Result<Url, ControlError>;

    /// Sends the engine's termination directive, if it has one, and closes
    /// the transport. Returns whether a directive was sent.
    async fn shutdown(&mut self) -> bool;

    /// Closes the transport without any directive.
    fn close(&mut self);
}

/// Control connection owned by one session.
pub struct ControlLink {
    strategy: Box<dyn ControlStrategy>,
    ctx: LinkContext,
}

impl ControlLink {
    /// Builds the link for `source`, picking the strategy for its backend.
    pub fn new(
        source: &SourceDescriptor,
        config: EngineConfig,
        launcher: Arc<dyn EngineLauncher>,
        registry: LaunchRegistry,
        exit: ExitFlag,
    ) -> Self {
        let strategy: Box<dyn ControlStrategy> = match source.backend() {
            BackendKind::Primary => Box::new(HandshakeStrategy::new(source.primary())),
            BackendKind::Alternate {
                tracker,
                gateway_path,
            } => Box::new(GatewayStrategy::new(
                source.primary(),
                tracker,
                gateway_path,
                registry,
            )),
        };

        Self {
            strategy,
            ctx: LinkContext::new(config, launcher, exit),
        }
    }

    /// Establishes the link and returns the data URL to stream from.
    ///
    /// Cancel-safe: dropping the future stops all further attempts.
    ///
    /// # Errors
    /// - `ControlError::EngineLaunchFailure` - Engine absent and could not be started
    /// - `ControlError::ProtocolError` - Engine answered `ERROR` or an unusable `PLAY`
    /// - `ControlError::UnexpectedDisconnect` - Engine hung up before answering
    /// - `ControlError::RetriesExhausted` - Configured attempt limit reached
    /// - `ControlError::Io` - Connection failed for a reason other than refusal
    /// - `ControlError::Cancelled` - Exit flag raised while establishing
    pub async fn connect(&mut self) -> Result<Url, ControlError> {
        let result = self.strategy.establish(&self.ctx).await;

        match &result {
            Ok(url) => {
                tracing::info!("Engine ready to play from {}", url);
                self.ctx.enter_state(ControlState::Playing);
            }
            Err(ControlError::Cancelled) => {
                tracing::debug!("Control link cancelled while establishing");
            }
            Err(e) => {
                tracing::warn!("Control link failed: {}", e);
                self.ctx.enter_state(ControlState::Errored);
            }
        }

        result
    }

    /// Sends the termination directive where the backend has one, then
    /// closes. Safe to call repeatedly; only the first call sends anything.
    pub async fn shutdown(&mut self) -> bool {
        self.ctx.enter_state(ControlState::ShuttingDown);
        self.strategy.shutdown().await
    }

    /// Closes without a termination directive.
    pub fn close(&mut self) {
        self.ctx.enter_state(ControlState::ShuttingDown);
        self.strategy.close();
    }

    pub fn status(&self) -> LinkStatus {
        self.ctx.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.ctx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let refused = ControlError::ConnectionRefused {
            address: "127.0.0.1:62063".to_string(),
        };
        assert!(refused.is_recoverable());
        assert!(!refused.is_fatal());

        assert!(ControlError::UnexpectedDisconnect.is_fatal());
        assert!(
            ControlError::ProtocolError {
                message: "no seeders".to_string()
            }
            .is_fatal()
        );
        assert!(!ControlError::Cancelled.is_fatal());
        assert!(!ControlError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_exit_flag_shared_between_clones() {
        let flag = ExitFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_set());

        flag.set();
        assert!(clone.is_set());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let status = LinkStatus {
            state: ControlState::RetryWait,
            retries: 2,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"state":"retry_wait","retries":2}"#);
    }
}
