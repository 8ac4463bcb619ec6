//! Actor driving one session from control link to final stop.
//!
//! The session moves through three phases. While establishing, the control
//! link is polled alongside the command channel. Once a data URL is known
//! (or the link failed and the dead-end URL stands in for it) the chosen
//! forwarder relays events until its final stop. Afterwards the session
//! idles, holding the control connection until shutdown or until every
//! handle is gone.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::Instrument;
use url::Url;

use super::commands::SessionCommand;
use super::handle::SessionHandle;
use super::{Session, SessionContext};
use crate::consumer::{SessionId, StreamConsumer};
use crate::control::{ControlError, ControlLink, ExitFlag};
use crate::forward::{self, DirectForwarder, Forwarder, ForwarderKind, Relay};
use crate::metadata::ShadowedResponse;
use crate::source::SourceDescriptor;
use crate::upstream::{FetchRequest, UpstreamConnection};

const COMMAND_BUFFER: usize = 8;

enum Phase {
    Control,
    Forwarding(Box<dyn Forwarder>),
    Idle,
    Exit,
}

enum Establish {
    Done(Result<Url, ControlError>),
    Interrupted(SessionCommand),
}

struct SessionActor {
    id: SessionId,
    source: SourceDescriptor,
    ctx: SessionContext,
    link: ControlLink,
    consumer: Arc<dyn StreamConsumer>,
    shadow: Option<ShadowedResponse>,
    exit: ExitFlag,
    forwarder_kind: watch::Sender<Option<ForwarderKind>>,
    commands_open: bool,
}

/// Spawns the actor for `session` and returns its handle.
pub(super) fn spawn_session(session: Session, consumer: Arc<dyn StreamConsumer>) -> SessionHandle {
    let Session {
        id,
        source,
        ctx,
        shadow,
        uris,
    } = session;

    let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
    let (forwarder_kind, forwarder_rx) = watch::channel(None);
    let exit = ExitFlag::new();
    let link = ControlLink::new(
        &source,
        ctx.config.engine.clone(),
        ctx.launcher.clone(),
        ctx.registry.clone(),
        exit.clone(),
    );

    let handle = SessionHandle::new(
        id,
        sender,
        exit.clone(),
        link.subscribe(),
        forwarder_rx,
        shadow.clone(),
        uris,
    );

    let span = tracing::info_span!(
        "session",
        id = %id,
        backend = source.backend().label(),
        asset = %source.primary(),
    );

    let actor = SessionActor {
        id,
        source,
        ctx,
        link,
        consumer,
        shadow,
        exit,
        forwarder_kind,
        commands_open: true,
    };
    tokio::spawn(run_actor_loop(actor, receiver).instrument(span));

    handle
}

async fn run_actor_loop(mut actor: SessionActor, mut receiver: mpsc::Receiver<SessionCommand>) {
    tracing::debug!("Session actor started");

    let mut phase = Phase::Control;
    loop {
        phase = match phase {
            Phase::Control => match actor.establish(&mut receiver).await {
                Establish::Done(result) => actor.start_forwarding(result),
                Establish::Interrupted(command) => actor.handle_command(command, None).await,
            },
            Phase::Forwarding(forwarder) => actor.forward(forwarder, &mut receiver).await,
            Phase::Idle => {
                if !actor.commands_open {
                    break;
                }
                match receiver.recv().await {
                    Some(command) => actor.handle_command(command, None).await,
                    None => {
                        actor.commands_open = false;
                        Phase::Idle
                    }
                }
            }
            Phase::Exit => break,
        };
    }

    actor.link.close();
    tracing::debug!("Session actor stopped");
}

impl SessionActor {
    /// Polls the control link until it yields or a command interrupts it.
    async fn establish(&mut self, receiver: &mut mpsc::Receiver<SessionCommand>) -> Establish {
        let connect = self.link.connect();
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return Establish::Done(result),
                command = receiver.recv(), if self.commands_open => match command {
                    Some(command) => return Establish::Interrupted(command),
                    None => self.commands_open = false,
                },
            }
        }
    }

    fn start_forwarding(&mut self, result: Result<Url, ControlError>) -> Phase {
        let forwarder: Box<dyn Forwarder> = match result {
            Ok(url) => {
                let engine = self.ctx.fetcher.open(FetchRequest::whole(url));
                forward::build_forwarder(
                    &self.source,
                    engine,
                    self.ctx.fetcher.clone(),
                    self.id,
                    self.shadow.clone(),
                )
            }
            Err(ControlError::Cancelled) => return Phase::Idle,
            Err(e) => {
                tracing::info!("Failing stream open after control link error: {}", e);
                Box::new(DirectForwarder::new(self.dead_end()))
            }
        };

        tracing::debug!("Forwarding with {} forwarder", forwarder.kind());
        self.forwarder_kind.send_replace(Some(forwarder.kind()));
        Phase::Forwarding(forwarder)
    }

    /// Connection to a resource that does not exist, so the consumer sees
    /// an ordinary failed open.
    fn dead_end(&self) -> UpstreamConnection {
        let dead_end = &self.ctx.config.failover.dead_end_url;
        match Url::parse(dead_end) {
            Ok(url) => self.ctx.fetcher.open(FetchRequest::whole(url)),
            Err(e) => {
                tracing::warn!("Dead-end URL {} unusable: {}", dead_end, e);
                UpstreamConnection::failed(format!("Failed to connect: {dead_end}"))
            }
        }
    }

    async fn forward(
        &mut self,
        mut forwarder: Box<dyn Forwarder>,
        receiver: &mut mpsc::Receiver<SessionCommand>,
    ) -> Phase {
        loop {
            tokio::select! {
                event = forwarder.next_event() => {
                    let Some(event) = event else {
                        return Phase::Idle;
                    };
                    if forwarder.relay(event, self.consumer.as_ref()).await == Relay::Finished {
                        tracing::debug!("Stream finished after {} bytes", forwarder.delivered());
                        return Phase::Idle;
                    }
                }
                command = receiver.recv(), if self.commands_open => match command {
                    Some(command) => return self.handle_command(command, Some(forwarder)).await,
                    None => self.commands_open = false,
                },
            }
        }
    }

    /// Handles a single command.
    async fn handle_command(
        &mut self,
        command: SessionCommand,
        forwarder: Option<Box<dyn Forwarder>>,
    ) -> Phase {
        self.exit.set();
        if let Some(mut forwarder) = forwarder {
            tracing::debug!("Closing forwarder after {} bytes", forwarder.delivered());
            forwarder.close();
        }

        match command {
            SessionCommand::Cancel => {
                tracing::info!("Session cancelled");
                self.link.close();
                Phase::Idle
            }
            SessionCommand::Shutdown { responder } => {
                if self.link.shutdown().await {
                    tracing::info!("Sent shutdown to engine");
                }
                let _ = responder.send(());
                Phase::Exit
            }
        }
    }
}
