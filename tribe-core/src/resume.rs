//! Finishing a stream from an HTTP mirror.
//!
//! When the engine stops short, the rest of the asset is requested from the
//! mirror with `Range: bytes=<offset>-`. The consumer already saw a start, so
//! this source never emits one. Only a 206 is accepted; anything else ends
//! the stream as failed, leaving what was already delivered in place.

use url::Url;

use crate::consumer::{ConnectionId, RequestIdentity, StopStatus, StreamConsumer};
use crate::forward::{ForwardError, Relay};
use crate::upstream::{DataFetcher, EventKind, FetchRequest, OpenStatus, UpstreamConnection, UpstreamEvent};

const PARTIAL_CONTENT: u16 = 206;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeState {
    AwaitingResponse,
    Streaming,
    Done,
}

/// HTTP connection resuming a stream at a byte offset.
#[derive(Debug)]
pub struct RangeResumeSource {
    connection: UpstreamConnection,
    url: Url,
    start_offset: u64,
    delivered_through: u64,
    state: ResumeState,
}

impl RangeResumeSource {
    /// Requests `url` from `start_offset` to the end.
    pub fn open(fetcher: &dyn DataFetcher, url: Url, start_offset: u64) -> Self {
        tracing::info!("Resuming stream from {} at byte {}", url, start_offset);
        let connection = fetcher.open(FetchRequest::from_offset(url.clone(), start_offset));

        Self {
            connection,
            url,
            start_offset,
            delivered_through: start_offset,
            state: ResumeState::AwaitingResponse,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Absolute offset one past the last byte this source relayed.
    pub fn delivered_through(&self) -> u64 {
        self.delivered_through
    }

    pub fn is_done(&self) -> bool {
        self.state == ResumeState::Done
    }

    /// Cancel-safe.
    pub async fn next_event(&mut self) -> Option<UpstreamEvent> {
        self.connection.next_event().await
    }

    /// Relays one event from this source's connection to `consumer`,
    /// attributed to `request`. Returns `Relay::Finished` once the final
    /// stop has been delivered.
    pub async fn relay(
        &mut self,
        kind: EventKind,
        request: RequestIdentity,
        consumer: &dyn StreamConsumer,
    ) -> Relay {
        if self.state == ResumeState::Done {
            return Relay::Finished;
        }

        match kind {
            EventKind::Start(head) => match head.open {
                OpenStatus::Connected {
                    status: PARTIAL_CONTENT,
                } => {
                    tracing::debug!(
                        "Mirror {} accepted range, Content-Range: {}",
                        self.url,
                        head.content_range().unwrap_or("-")
                    );
                    self.state = ResumeState::Streaming;
                    Relay::Continue
                }
                OpenStatus::Connected { status } => {
                    self.abort(
                        ForwardError::FailoverRejected { status },
                        request,
                        consumer,
                    )
                    .await
                }
                OpenStatus::Failed { reason } => {
                    self.abort(
                        ForwardError::FailoverConnection { reason },
                        request,
                        consumer,
                    )
                    .await
                }
            },
            EventKind::Data { offset, bytes } => {
                if self.state == ResumeState::Streaming {
                    let absolute = self.start_offset + offset;
                    self.delivered_through = self
                        .delivered_through
                        .max(absolute + bytes.len() as u64);
                    consumer.on_data(request, absolute, bytes).await;
                }
                Relay::Continue
            }
            EventKind::Stop(status) => {
                tracing::debug!("Mirror stream ended: {}", status);
                self.state = ResumeState::Done;
                consumer.on_stop(request, status).await;
                Relay::Finished
            }
        }
    }

    pub fn cancel(&mut self) {
        self.connection.cancel();
        self.state = ResumeState::Done;
    }

    async fn abort(
        &mut self,
        error: ForwardError,
        request: RequestIdentity,
        consumer: &dyn StreamConsumer,
    ) -> Relay {
        tracing::warn!("Aborting failover to {}: {}", self.url, error);
        self.cancel();
        consumer
            .on_stop(request, StopStatus::failure(error.to_string()))
            .await;
        Relay::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mocks::{ConsumerEvent, RecordingConsumer, ScriptedFetcher};

    const MIRROR: &str = "http://mirror.example/video.ogg";

    async fn drain(source: &mut RangeResumeSource, consumer: &RecordingConsumer) {
        while let Some(event) = source.next_event().await {
            let request = RequestIdentity::Connection(event.connection);
            if source.relay(event.kind, request, consumer).await == Relay::Finished {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_partial_content_relayed_at_absolute_offsets() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond(
            MIRROR,
            206,
            &[("content-range", "bytes 400-999/1000")],
            &[7u8; 600],
            250,
            StopStatus::Success,
        );
        let consumer = RecordingConsumer::new();

        let mut source = RangeResumeSource::open(&fetcher, Url::parse(MIRROR).unwrap(), 400);
        drain(&mut source, &consumer).await;

        assert_eq!(fetcher.requests()[0].range_header(), Some("bytes=400-".to_string()));
        assert_eq!(consumer.start_count(), 0);
        let offsets: Vec<u64> = consumer
            .events()
            .iter()
            .filter_map(|event| match event {
                ConsumerEvent::Data { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![400, 650, 900]);
        assert_eq!(consumer.stops(), vec![StopStatus::Success]);
        assert_eq!(source.delivered_through(), 1000);
    }

    #[tokio::test]
    async fn test_full_response_rejected() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond(MIRROR, 200, &[], &[1u8; 1000], 500, StopStatus::Success);
        let consumer = RecordingConsumer::new();

        let mut source = RangeResumeSource::open(&fetcher, Url::parse(MIRROR).unwrap(), 400);
        drain(&mut source, &consumer).await;

        assert_eq!(consumer.data_count(), 0);
        let stops = consumer.stops();
        assert_eq!(stops.len(), 1);
        assert!(matches!(&stops[0], StopStatus::Failure { reason } if reason.contains("200")));
        assert!(source.is_done());
    }

    #[tokio::test]
    async fn test_unreachable_mirror_fails_stream() {
        let fetcher = ScriptedFetcher::new();
        let consumer = RecordingConsumer::new();

        let mut source = RangeResumeSource::open(&fetcher, Url::parse(MIRROR).unwrap(), 10);
        drain(&mut source, &consumer).await;

        assert_eq!(consumer.start_count(), 0);
        assert!(matches!(
            consumer.stops().as_slice(),
            [StopStatus::Failure { .. }]
        ));
    }
}
