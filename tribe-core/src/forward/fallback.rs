//! Engine relay that finishes the stream from an HTTP mirror.
//!
//! The engine's announced length is remembered at start. If the engine stops
//! before reaching it, the engine connection is dropped and the remainder is
//! requested from the mirror at the last delivered offset. The consumer sees
//! one start, contiguous data, and one stop. Failover happens at most once.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::{ForwardError, Forwarder, ForwarderKind, Relay};
use crate::consumer::{ConnectionId, RequestIdentity, StopStatus, StreamConsumer};
use crate::cursor::StreamCursor;
use crate::resume::RangeResumeSource;
use crate::upstream::{DataFetcher, EventKind, UpstreamConnection, UpstreamEvent};

enum Upstream {
    Engine(UpstreamConnection),
    Mirror(RangeResumeSource),
    Idle,
}

pub struct FallbackForwarder {
    engine_id: ConnectionId,
    upstream: Upstream,
    fallback: Url,
    fetcher: Arc<dyn DataFetcher>,
    cursor: StreamCursor,
    failed_over: bool,
    finished: bool,
}

impl FallbackForwarder {
    pub fn new(engine: UpstreamConnection, fallback: Url, fetcher: Arc<dyn DataFetcher>) -> Self {
        Self {
            engine_id: engine.id(),
            upstream: Upstream::Engine(engine),
            fallback,
            fetcher,
            cursor: StreamCursor::new(),
            failed_over: false,
            finished: false,
        }
    }

    pub fn has_failed_over(&self) -> bool {
        self.failed_over
    }

    pub fn cursor(&self) -> &StreamCursor {
        &self.cursor
    }

    async fn relay_engine(&mut self, kind: EventKind, consumer: &dyn StreamConsumer) -> Relay {
        let request = RequestIdentity::Connection(self.engine_id);

        match kind {
            EventKind::Start(head) => {
                let length = head.content_length();
                match length {
                    Some(length) => tracing::debug!("Engine announced {} bytes", length),
                    None => tracing::debug!("Engine announced no length"),
                }
                self.cursor.expect_length(length);
                consumer.on_start(request, &head).await;
                Relay::Continue
            }
            EventKind::Data { offset, bytes } => {
                if self.cursor.is_finalized() {
                    tracing::trace!(
                        "Dropping {} engine bytes at {} after engine stop",
                        bytes.len(),
                        offset
                    );
                    return Relay::Continue;
                }
                let len = bytes.len() as u64;
                consumer.on_data(request, offset, bytes).await;
                self.cursor.record_delivery(offset, len);
                Relay::Continue
            }
            EventKind::Stop(status) => {
                if !self.cursor.finalize() {
                    return Relay::Continue;
                }

                if self.cursor.is_complete() {
                    tracing::debug!(
                        "Engine delivered {} bytes, stream complete (engine status {})",
                        self.cursor.last_delivered_offset(),
                        status
                    );
                    return self.finish(request, StopStatus::Success, consumer).await;
                }

                let incomplete = ForwardError::StreamIncomplete {
                    delivered: self.cursor.last_delivered_offset(),
                    expected: self.cursor.expected_length().unwrap_or(0),
                };
                debug_assert!(!self.failed_over, "engine stopped twice");

                tracing::info!("{}, failing over to {}", incomplete, self.fallback);
                self.fail_over();
                Relay::Continue
            }
        }
    }

    fn fail_over(&mut self) {
        if let Upstream::Engine(mut engine) = std::mem::replace(&mut self.upstream, Upstream::Idle)
        {
            engine.cancel();
        }
        self.failed_over = true;
        self.upstream = Upstream::Mirror(RangeResumeSource::open(
            self.fetcher.as_ref(),
            self.fallback.clone(),
            self.cursor.last_delivered_offset(),
        ));
    }

    async fn finish(
        &mut self,
        request: RequestIdentity,
        status: StopStatus,
        consumer: &dyn StreamConsumer,
    ) -> Relay {
        self.close();
        consumer.on_stop(request, status).await;
        Relay::Finished
    }
}

#[async_trait]
impl Forwarder for FallbackForwarder {
    fn kind(&self) -> ForwarderKind {
        ForwarderKind::FallbackCapable
    }

    async fn next_event(&mut self) -> Option<UpstreamEvent> {
        match &mut self.upstream {
            Upstream::Engine(engine) => engine.next_event().await,
            Upstream::Mirror(mirror) => mirror.next_event().await,
            Upstream::Idle => None,
        }
    }

    async fn relay(&mut self, event: UpstreamEvent, consumer: &dyn StreamConsumer) -> Relay {
        if self.finished {
            return Relay::Finished;
        }

        if event.connection == self.engine_id {
            return self.relay_engine(event.kind, consumer).await;
        }

        let Upstream::Mirror(mirror) = &mut self.upstream else {
            return Relay::Continue;
        };
        if mirror.id() != event.connection {
            return Relay::Continue;
        }

        let request = RequestIdentity::Connection(event.connection);
        let relay = mirror.relay(event.kind, request, consumer).await;
        self.cursor.record_delivery(mirror.delivered_through(), 0);

        if relay == Relay::Finished {
            self.upstream = Upstream::Idle;
            self.finished = true;
        }
        relay
    }

    fn close(&mut self) {
        match std::mem::replace(&mut self.upstream, Upstream::Idle) {
            Upstream::Engine(mut engine) => engine.cancel(),
            Upstream::Mirror(mut mirror) => mirror.cancel(),
            Upstream::Idle => {}
        }
        self.finished = true;
    }

    fn delivered(&self) -> u64 {
        self.cursor.last_delivered_offset()
    }
}
