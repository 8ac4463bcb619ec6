//! One-to-one relay of the engine's data connection.

use async_trait::async_trait;

use super::{Forwarder, ForwarderKind, Relay};
use crate::consumer::{RequestIdentity, StreamConsumer};
use crate::upstream::{EventKind, UpstreamConnection, UpstreamEvent};

#[derive(Debug)]
pub struct DirectForwarder {
    connection: UpstreamConnection,
    delivered: u64,
    finished: bool,
}

impl DirectForwarder {
    pub fn new(connection: UpstreamConnection) -> Self {
        Self {
            connection,
            delivered: 0,
            finished: false,
        }
    }
}

#[async_trait]
impl Forwarder for DirectForwarder {
    fn kind(&self) -> ForwarderKind {
        ForwarderKind::Direct
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

        let request = RequestIdentity::Connection(event.connection);
        match event.kind {
            EventKind::Start(head) => consumer.on_start(request, &head).await,
            EventKind::Data { offset, bytes } => {
                self.delivered = self.delivered.max(offset + bytes.len() as u64);
                consumer.on_data(request, offset, bytes).await;
            }
            EventKind::Stop(status) => {
                self.finished = true;
                consumer.on_stop(request, status).await;
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
    use crate::consumer::StopStatus;
    use crate::test_mocks::{ConsumerEvent, RecordingConsumer, ScriptedFetcher};
    use crate::upstream::{DataFetcher, FetchRequest};

    const ENGINE: &str = "http://127.0.0.1:6878/stream";

    #[tokio::test]
    async fn test_relays_every_event_in_order() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond(
            ENGINE,
            200,
            &[("content-length", "10")],
            b"0123456789",
            4,
            StopStatus::Success,
        );
        let consumer = RecordingConsumer::new();

        let connection = fetcher.open(FetchRequest::whole(Url::parse(ENGINE).unwrap()));
        let id = connection.id();
        let mut forwarder = DirectForwarder::new(connection);
        while let Some(event) = forwarder.next_event().await {
            if forwarder.relay(event, &consumer).await == Relay::Finished {
                break;
            }
        }

        let request = RequestIdentity::Connection(id);
        assert_eq!(
            consumer.events(),
            vec![
                ConsumerEvent::Start {
                    request,
                    status: Some(200)
                },
                ConsumerEvent::Data {
                    request,
                    offset: 0,
                    len: 4
                },
                ConsumerEvent::Data {
                    request,
                    offset: 4,
                    len: 4
                },
                ConsumerEvent::Data {
                    request,
                    offset: 8,
                    len: 2
                },
                ConsumerEvent::Stop {
                    request,
                    status: StopStatus::Success
                },
            ]
        );
        assert_eq!(consumer.body(), b"0123456789");
        assert_eq!(forwarder.delivered(), 10);
    }

    #[tokio::test]
    async fn test_failed_open_relayed_as_failure() {
        let fetcher = ScriptedFetcher::new();
        let consumer = RecordingConsumer::new();

        let connection = fetcher.open(FetchRequest::whole(Url::parse(ENGINE).unwrap()));
        let mut forwarder = DirectForwarder::new(connection);
        while let Some(event) = forwarder.next_event().await {
            if forwarder.relay(event, &consumer).await == Relay::Finished {
                break;
            }
        }

        assert_eq!(consumer.start_count(), 1);
        assert_eq!(consumer.data_count(), 0);
        assert!(matches!(
            consumer.stops().as_slice(),
            [StopStatus::Failure { .. }]
        ));
    }
}
