//! Upstream data connections.
//!
//! A [`DataFetcher`] opens HTTP-style connections that report, in order, one
//! start, zero or more data chunks and one stop. Connections run on their own
//! task and hand events over a channel, so reading them is cancel-safe and
//! can sit inside `tokio::select!`.

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::consumer::{ConnectionId, StopStatus};

mod http;

pub use http::HttpFetcher;

const EVENT_BUFFER: usize = 32;

/// Outcome of opening a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenStatus {
    /// Response head received with this HTTP status
    Connected { status: u16 },
    /// No response, e.g. connection refused
    Failed { reason: String },
}

/// What a connection knows when it starts.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub open: OpenStatus,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn connected(status: u16, headers: HeaderMap) -> Self {
        Self {
            open: OpenStatus::Connected { status },
            headers,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            open: OpenStatus::Failed {
                reason: reason.into(),
            },
            headers: HeaderMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.open, OpenStatus::Connected { .. })
    }

    /// HTTP status, if the connection got that far.
    pub fn status(&self) -> Option<u16> {
        match self.open {
            OpenStatus::Connected { status } => Some(status),
            OpenStatus::Failed { .. } => None,
        }
    }

    /// Header value by case-insensitive name. Non-ASCII values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Declared body length. Missing or malformed values are `None`.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn content_range(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
    }
}

/// Event payload of an upstream connection.
#[derive(Debug, Clone)]
pub enum EventKind {
    Start(ResponseHead),
    /// `offset` is relative to the start of this connection's body.
    Data {
        offset: u64,
        bytes: Bytes,
    },
    Stop(StopStatus),
}

/// Event tagged with the connection that produced it.
#[derive(Debug, Clone)]
pub struct UpstreamEvent {
    pub connection: ConnectionId,
    pub kind: EventKind,
}

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    /// Sends `Range: bytes=<start>-` when set
    pub range_start: Option<u64>,
}

impl FetchRequest {
    pub fn whole(url: Url) -> Self {
        Self {
            url,
            range_start: None,
        }
    }

    pub fn from_offset(url: Url, offset: u64) -> Self {
        Self {
            url,
            range_start: Some(offset),
        }
    }

    pub fn range_header(&self) -> Option<String> {
        self.range_start.map(|start| format!("bytes={start}-"))
    }
}

/// Opens upstream data connections.
pub trait DataFetcher: Send + Sync {
    /// Starts a connection. All outcomes, including failure to connect,
    /// arrive as events on the returned connection.
    fn open(&self, request: FetchRequest) -> UpstreamConnection;
}

/// Producer half handed to the task driving a connection.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<EventKind>,
}

impl EventSink {
    /// Returns false once the connection has been dropped or cancelled.
    pub async fn start(&self, head: ResponseHead) -> bool {
        self.sender.send(EventKind::Start(head)).await.is_ok()
    }

    pub async fn data(&self, offset: u64, bytes: Bytes) -> bool {
        self.sender
            .send(EventKind::Data { offset, bytes })
            .await
            .is_ok()
    }

    pub async fn stop(&self, status: StopStatus) -> bool {
        self.sender.send(EventKind::Stop(status)).await.is_ok()
    }
}

/// Consumer half of an open connection.
///
/// Dropping or cancelling the connection aborts the task feeding it.
#[derive(Debug)]
pub struct UpstreamConnection {
    id: ConnectionId,
    receiver: mpsc::Receiver<EventKind>,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

impl UpstreamConnection {
    /// Spawns `driver` on its own task and returns the connection it feeds.
    pub fn spawn<F, Fut>(driver: F) -> Self
    where
        F: FnOnce(EventSink) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(driver(EventSink { sender }));

        Self {
            id: ConnectionId::new(),
            receiver,
            task: Some(task),
            stopped: false,
        }
    }

    /// Connection that reports a failed open and stops.
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::spawn(move |sink| async move {
            if sink.start(ResponseHead::failed(reason.clone())).await {
                sink.stop(StopStatus::failure(reason)).await;
            }
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next event, or `None` once the stop has been delivered.
    ///
    /// A driver that goes away without sending a stop yields a synthetic
    /// failed stop, so every connection ends with exactly one.
    pub async fn next_event(&mut self) -> Option<UpstreamEvent> {
        if self.stopped {
            return None;
        }

        let kind = match self.receiver.recv().await {
            Some(kind) => kind,
            None => EventKind::Stop(StopStatus::failure("connection closed without status")),
        };

        if matches!(kind, EventKind::Stop(_)) {
            self.stopped = true;
            self.receiver.close();
        }

        Some(UpstreamEvent {
            connection: self.id,
            kind,
        })
    }

    /// Stops the connection. No further events are produced.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.receiver.close();
        self.stopped = true;
    }

    pub fn is_finished(&self) -> bool {
        self.stopped
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
