//! Tribe Simulation - Stand-ins for P2P engines and HTTP mirrors.

#![warn(clippy::missing_errors_doc)]
//!
//! Every simulator is a real TCP server on loopback, so sessions are
//! exercised through the same sockets and HTTP client they use against
//! deployed engines.
//!
//! - [`SimulatedEngine`]: speaks the control protocol and answers each
//!   handshake with a scripted reply
//! - [`SimulatedGateway`]: engine data connection that can declare more bytes
//!   than it delivers
//! - [`SimulatedMirror`]: HTTP mirror that honours, ignores or refuses range
//!   requests
//! - [`FailoverScenario`]: runs a complete session against all three
//!
//! # Example
//!
//! ```rust,no_run
//! use tribe_sim::{FailoverScenario, MirrorMode};
//!
//! # async fn run() -> Result<(), tribe_sim::SimError> {
//! let report = FailoverScenario::new(1000, 400, MirrorMode::Honour).run().await?;
//! assert!(report.intact);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod gateway;
pub mod mirror;
pub mod scenarios;

pub use engine::{EngineBehavior, SimulatedEngine};
pub use gateway::SimulatedGateway;
pub use mirror::{MirrorMode, SimulatedMirror};
pub use scenarios::{FailoverScenario, ScenarioReport};

/// Errors from setting up or running a simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Simulated server I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scenario: {reason}")]
    InvalidScenario { reason: String },

    #[error("Invalid source descriptor: {0}")]
    Source(#[from] tribe_core::SourceError),

    #[error("Session setup failed: {0}")]
    Client(#[from] tribe_core::TribeError),

    #[error("Session did not finish within {seconds}s")]
    Timeout { seconds: u64 },
}

/// Deterministic asset content of `length` bytes.
///
/// Byte `i` is `i % 251`, so misplaced ranges show up as content mismatches.
pub fn asset_bytes(length: usize) -> bytes::Bytes {
    (0..length).map(|i| (i % 251) as u8).collect()
}
