//! Command definitions for the session actor.

use tokio::sync::oneshot;

/// Commands a [`SessionHandle`](super::SessionHandle) sends to its session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Stops launch and retry attempts and closes any open data connection.
    /// The consumer is not sent a stop.
    Cancel,

    /// Like `Cancel`, then sends the engine's termination directive and
    /// closes the control connection. The session actor exits afterwards.
    Shutdown { responder: oneshot::Sender<()> },
}
