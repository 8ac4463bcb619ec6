//! Tribe Core - Bridging P2P media engines to stream consumers
//!
//! This crate connects a media consumer to a local P2P delivery engine:
//! it drives the engine's control link (launching the engine when absent),
//! relays the engine's data connection, and fails over to an HTTP mirror or
//! to an ordinary failed open when the engine cannot deliver.

pub mod config;
pub mod consumer;
pub mod control;
pub mod cursor;
pub mod forward;
pub mod launcher;
pub mod metadata;
pub mod resume;
pub mod session;
pub mod source;
pub mod tracing_setup;
pub mod upstream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

// Re-export main types for convenient access
pub use config::TribeConfig;
pub use consumer::{RequestIdentity, StopStatus, StreamConsumer};
pub use control::{ControlError, ControlState};
pub use forward::{ForwardError, ForwarderKind};
pub use launcher::{EngineLauncher, LaunchError, ProcessLauncher};
pub use metadata::ResponseMetadata;
pub use session::{Session, SessionContext, SessionHandle};
pub use source::{SourceDescriptor, SourceError};
pub use upstream::{DataFetcher, HttpFetcher, ResponseHead};

/// Errors that can bubble up from any Tribe subsystem.
///
/// Sessions never return these to the consumer; they end the stream
/// instead. These reach hosts through descriptor parsing, configuration
/// and engine management.
#[derive(Debug, thiserror::Error)]
pub enum TribeError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Control link error: {0}")]
    Control(#[from] ControlError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Forwarding error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TribeError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TribeError::Source(e) => match e {
                SourceError::MissingPrimary { .. } => "No media asset given".to_string(),
                SourceError::InvalidFallback { url, .. } => {
                    format!("Fallback address is not a valid URL: {url}")
                }
            },
            TribeError::Control(e) => match e {
                ControlError::EngineLaunchFailure { .. } => {
                    "Could not start the P2P engine".to_string()
                }
                ControlError::ProtocolError { message } => {
                    format!("The P2P engine refused the stream: {message}")
                }
                ControlError::RetriesExhausted { .. } => {
                    "The P2P engine did not come up".to_string()
                }
                _ => "Lost contact with the P2P engine".to_string(),
            },
            TribeError::Launch(LaunchError::BinaryMissing { path }) => {
                format!("P2P engine not installed at {path}")
            }
            TribeError::Launch(_) => "Could not start the P2P engine".to_string(),
            TribeError::Forward(_) => "Stream interrupted".to_string(),
            TribeError::Configuration { .. } => "Configuration error occurred".to_string(),
            TribeError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TribeError::Configuration { .. } | TribeError::Source(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TribeError>;
