//! Relay for metadata-mode sessions.
//!
//! Every event is attributed to the session rather than the engine's data
//! connection, and the engine's response head is kept so the session can
//! answer header and status queries as if it were the response itself.
//! The engine's final status is not passed on; the stream always stops as
//! successful.

use async_trait::async_trait;

use super::{Forwarder, ForwarderKind, Relay};
use crate::consumer::{RequestIdentity, SessionId, StopStatus, StreamConsumer};
use crate::metadata::{ResponseMetadata, ShadowedResponse};
use crate::upstream::{EventKind, UpstreamConnection, UpstreamEvent};

#[derive(Debug)]
pub struct MetadataShadowedForwarder {
    connection: UpstreamConnection,
    session: SessionId,
    shadow: ShadowedResponse,
    delivered: u64,
    finished: bool,
}

impl MetadataShadowedForwarder {
    pub fn new(connection: UpstreamConnection, session: SessionId, shadow: ShadowedResponse) -> Self {
        Self {
            connection,
            session,
            shadow,
            delivered: 0,
            finished: false,
        }
    }

    pub fn shadow(&self) -> &ShadowedResponse {
        &self.shadow
    }
}

impl ResponseMetadata for MetadataShadowedForwarder {
    fn response_header(&self, name: &str) -> Option<String> {
        self.shadow.response_header(name)
    }

    fn response_status(&self) -> Option<u16> {
        self.shadow.response_status()
    }
}

#[async_trait]
impl Forwarder for MetadataShadowedForwarder {
    fn kind(&self) -> ForwarderKind {
        ForwarderKind::MetadataShadowed
    }

    async fn next_event(&mut self) -> Option<UpstreamEvent> {
        self.connection.next_event().await
    }

    async fn relay(&mut self, event: UpstreamEvent, consumer: &dyn StreamConsumer) -> Relay {
        if self.finished {
            return Relay::Finished;
        }
        if event.connection != self.connection.id() {
            return Relay::Continue;
        }

        let request = RequestIdentity::Session(self.session);
        match event.kind {
            EventKind::Start(head) => {
                self.shadow.record(&head);
                consumer.on_start(request, &head).await;
            }
            EventKind::Data { offset, bytes } => {
                self.delivered = self.delivered.max(offset + bytes.len() as u64);
                consumer.on_data(request, offset, bytes).await;
            }
            EventKind::Stop(status) => {
                if let StopStatus::Failure { reason } = &status {
                    tracing::debug!("Metadata stream ended with engine failure: {}", reason);
                }
                self.finished = true;
                consumer.on_stop(request, StopStatus::Success).await;
                return Relay::Finished;
            }
        }
        Relay::Continue
    }

    fn close(&mut self) {
        self.connection.cancel();
        self.finished = true;
    }

    fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::test_mocks::{ConsumerEvent, RecordingConsumer, ScriptedFetcher};
    use crate::upstream::{DataFetcher, FetchRequest};

    const ENGINE: &str = "http://127.0.0.1:6878/meta";

    async fn run(forwarder: &mut MetadataShadowedForwarder, consumer: &RecordingConsumer) {
        while let Some(event) = forwarder.next_event().await {
            if forwarder.relay(event, consumer).await == Relay::Finished {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_events_attributed_to_session() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond(
            ENGINE,
            200,
            &[("content-type", "text/xml")],
            b"<meta/>",
            3,
            StopStatus::Success,
        );
        let consumer = RecordingConsumer::new();
        let session = SessionId::new();

        let connection = fetcher.open(FetchRequest::whole(Url::parse(ENGINE).unwrap()));
        let mut forwarder =
            MetadataShadowedForwarder::new(connection, session, ShadowedResponse::new());
        run(&mut forwarder, &consumer).await;

        let request = RequestIdentity::Session(session);
        assert!(consumer.events().iter().all(|event| match event {
            ConsumerEvent::Start { request: r, .. }
            | ConsumerEvent::Data { request: r, .. }
            | ConsumerEvent::Stop { request: r, .. } => *r == request,
        }));
        assert_eq!(consumer.body(), b"<meta/>");
        assert_eq!(forwarder.content_type().as_deref(), Some("text/xml"));
        assert_eq!(forwarder.response_status(), Some(200));
    }

    #[tokio::test]
    async fn test_engine_failure_stops_as_success() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond(ENGINE, 200, &[], b"partial", 7, StopStatus::failure("reset"));
        let consumer = RecordingConsumer::new();
        let shadow = ShadowedResponse::new();

        let connection = fetcher.open(FetchRequest::whole(Url::parse(ENGINE).unwrap()));
        let mut forwarder = MetadataShadowedForwarder::new(connection, SessionId::new(), shadow.clone());
        run(&mut forwarder, &consumer).await;

        assert_eq!(consumer.stops(), vec![StopStatus::Success]);
        assert!(shadow.is_recorded());
    }
}
