//! Handle for communicating with a session actor.

use tokio::sync::{mpsc, oneshot, watch};

use super::commands::SessionCommand;
use crate::consumer::SessionId;
use crate::control::{ControlState, ExitFlag, LinkStatus};
use crate::forward::ForwarderKind;
use crate::metadata::{ResponseMetadata, ShadowUris, ShadowedResponse};

/// Handle to an open session.
///
/// Cheap to clone. Dropping every handle does not stop the stream; the
/// session finishes relaying and then releases its control connection.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    sender: mpsc::Sender<SessionCommand>,
    exit: ExitFlag,
    status: watch::Receiver<LinkStatus>,
    forwarder: watch::Receiver<Option<ForwarderKind>>,
    shadow: Option<ShadowedResponse>,
    uris: Option<ShadowUris>,
}

impl SessionHandle {
    pub(super) fn new(
        id: SessionId,
        sender: mpsc::Sender<SessionCommand>,
        exit: ExitFlag,
        status: watch::Receiver<LinkStatus>,
        forwarder: watch::Receiver<Option<ForwarderKind>>,
        shadow: Option<ShadowedResponse>,
        uris: Option<ShadowUris>,
    ) -> Self {
        Self {
            id,
            sender,
            exit,
            status,
            forwarder,
            shadow,
            uris,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ControlState {
        self.status().state
    }

    /// Refused connections followed by an engine launch so far.
    pub fn retry_count(&self) -> u32 {
        self.status().retries
    }

    /// Forwarder serving the stream, once the control link has produced a
    /// data URL or given up.
    pub fn forwarder_kind(&self) -> Option<ForwarderKind> {
        *self.forwarder.borrow()
    }

    /// Waits until a forwarder has been chosen. `None` if the session ended
    /// without choosing one, e.g. after a cancel.
    pub async fn forwarder_selected(&self) -> Option<ForwarderKind> {
        let mut forwarder = self.forwarder.clone();
        match forwarder.wait_for(Option::is_some).await {
            Ok(kind) => *kind,
            Err(_) => None,
        }
    }

    /// Stops the session without a termination directive.
    ///
    /// The exit flag is raised before the actor sees the command, so no
    /// launch or retry starts after this returns. Calling it on a session
    /// that already ended does nothing.
    pub async fn cancel(&self) {
        self.exit.set();
        if self.sender.send(SessionCommand::Cancel).await.is_err() {
            tracing::trace!("Cancel for {} ignored, session already ended", self.id);
        }
    }

    /// Stops the session and tells the engine to terminate.
    ///
    /// Returns once the control connection is closed. Only the first call
    /// sends anything; later calls return immediately.
    pub async fn shutdown(&self) {
        self.exit.set();

        let (responder, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Shutdown { responder })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    /// Whether the session actor is still alive.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn is_metadata_mode(&self) -> bool {
        self.shadow.is_some()
    }

    /// URI reported to consumers in place of the descriptor. Metadata mode only.
    pub fn presented_uri(&self) -> Option<&str> {
        self.uris.as_ref().map(|uris| uris.presented.as_str())
    }

    /// URI reported as the request's original URI. Metadata mode only.
    pub fn original_uri(&self) -> Option<&str> {
        self.uris.as_ref().map(|uris| uris.original.as_str())
    }
}

impl ResponseMetadata for SessionHandle {
    fn response_header(&self, name: &str) -> Option<String> {
        self.shadow.as_ref()?.response_header(name)
    }

    fn response_status(&self) -> Option<u16> {
        self.shadow.as_ref()?.response_status()
    }
}
