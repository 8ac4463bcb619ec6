//! Mock collaborators for exercising sessions without real engines.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::watch;

use crate::consumer::{RequestIdentity, StopStatus, StreamConsumer};
use crate::launcher::{EngineLauncher, LaunchError, LaunchRequest};
use crate::upstream::{DataFetcher, FetchRequest, ResponseHead, UpstreamConnection};

type LaunchHook = Arc<dyn Fn(LaunchRequest) -> BoxFuture<'static, ()> + Send + Sync>;

/// Launcher that records requests instead of starting processes.
#[derive(Clone)]
pub struct MockLauncher {
    requests: Arc<Mutex<Vec<LaunchRequest>>>,
    should_fail: bool,
    hook: Option<LaunchHook>,
}

impl MockLauncher {
    /// Creates a launcher whose launches succeed and do nothing.
    pub fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            should_fail: false,
            hook: None,
        }
    }

    /// Creates a launcher whose launches always fail.
    pub fn new_with_launch_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new()
        }
    }

    /// Creates a launcher that runs `hook` on every launch before reporting
    /// success, e.g. to bring up a simulated engine.
    pub fn with_hook<F, Fut>(hook: F) -> Self
    where
        F: Fn(LaunchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            hook: Some(Arc::new(move |request| -> BoxFuture<'static, ()> {
                Box::pin(hook(request))
            })),
            ..Self::new()
        }
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineLauncher for MockLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        self.requests.lock().push(request.clone());

        if self.should_fail {
            return Err(LaunchError::BinaryMissing {
                path: "bgprocess/mock-engine".to_string(),
            });
        }

        if let Some(hook) = &self.hook {
            hook(request.clone()).await;
        }
        Ok(())
    }
}

/// Event as seen by a [`RecordingConsumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Start {
        request: RequestIdentity,
        status: Option<u16>,
    },
    Data {
        request: RequestIdentity,
        offset: u64,
        len: usize,
    },
    Stop {
        request: RequestIdentity,
        status: StopStatus,
    },
}

/// Consumer that keeps everything it is given.
#[derive(Clone)]
pub struct RecordingConsumer {
    events: Arc<Mutex<Vec<ConsumerEvent>>>,
    body: Arc<Mutex<Vec<u8>>>,
    stopped: watch::Sender<Option<StopStatus>>,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(None);
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            body: Arc::new(Mutex::new(Vec::new())),
            stopped,
        }
    }

    pub fn events(&self) -> Vec<ConsumerEvent> {
        self.events.lock().clone()
    }

    /// Concatenation of every data chunk, in arrival order.
    pub fn body(&self) -> Vec<u8> {
        self.body.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.count(|event| matches!(event, ConsumerEvent::Start { .. }))
    }

    pub fn data_count(&self) -> usize {
        self.count(|event| matches!(event, ConsumerEvent::Data { .. }))
    }

    pub fn stops(&self) -> Vec<StopStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ConsumerEvent::Stop { status, .. } => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    /// Waits for the first stop, giving up after `timeout`.
    pub async fn wait_for_stop(&self, timeout: Duration) -> Option<StopStatus> {
        let mut receiver = self.stopped.subscribe();
        let waited = tokio::time::timeout(timeout, receiver.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(status)) => status.clone(),
            _ => None,
        }
    }

    fn count(&self, predicate: impl Fn(&ConsumerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }
}

impl Default for RecordingConsumer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamConsumer for RecordingConsumer {
    async fn on_start(&self, request: RequestIdentity, head: &ResponseHead) {
        self.events.lock().push(ConsumerEvent::Start {
            request,
            status: head.status(),
        });
    }

    async fn on_data(&self, request: RequestIdentity, offset: u64, data: Bytes) {
        self.events.lock().push(ConsumerEvent::Data {
            request,
            offset,
            len: data.len(),
        });
        self.body.lock().extend_from_slice(&data);
    }

    async fn on_stop(&self, request: RequestIdentity, status: StopStatus) {
        self.events.lock().push(ConsumerEvent::Stop {
            request,
            status: status.clone(),
        });
        self.stopped.send_if_modified(|stopped| {
            if stopped.is_none() {
                *stopped = Some(status);
                true
            } else {
                false
            }
        });
    }
}

/// One step of a scripted connection.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Start(ResponseHead),
    Data(Bytes),
    Stop(StopStatus),
    /// Never finishes; the connection stays open until cancelled
    Hold,
}

/// Fetcher replaying canned responses per URL.
///
/// URLs without a script fail to connect, like a closed port.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    scripts: Arc<Mutex<HashMap<String, Vec<ScriptStep>>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: &str, steps: Vec<ScriptStep>) {
        self.scripts.lock().insert(url.to_string(), steps);
    }

    /// Scripts a response with `status`, `headers` and `body` in `chunk`-sized
    /// pieces, ending with `end`.
    pub fn respond(
        &self,
        url: &str,
        status: u16,
        headers: &[(&'static str, &str)],
        body: &[u8],
        chunk: usize,
        end: StopStatus,
    ) {
        let mut steps = vec![ScriptStep::Start(head(status, headers))];
        steps.extend(
            body.chunks(chunk.max(1))
                .map(|piece| ScriptStep::Data(Bytes::copy_from_slice(piece))),
        );
        steps.push(ScriptStep::Stop(end));
        self.script(url, steps);
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

impl DataFetcher for ScriptedFetcher {
    fn open(&self, request: FetchRequest) -> UpstreamConnection {
        self.requests.lock().push(request.clone());
        let steps = self.scripts.lock().get(request.url.as_str()).cloned();

        UpstreamConnection::spawn(move |sink| async move {
            let Some(steps) = steps else {
                let reason = format!("Failed to connect: {}", request.url);
                if sink.start(ResponseHead::failed(reason.clone())).await {
                    sink.stop(StopStatus::failure(reason)).await;
                }
                return;
            };

            let mut offset = 0u64;
            for step in steps {
                let delivered = match step {
                    ScriptStep::Start(head) => sink.start(head).await,
                    ScriptStep::Data(bytes) => {
                        let len = bytes.len() as u64;
                        let delivered = sink.data(offset, bytes).await;
                        offset += len;
                        delivered
                    }
                    ScriptStep::Stop(status) => sink.stop(status).await,
                    ScriptStep::Hold => std::future::pending().await,
                };
                if !delivered {
                    return;
                }
            }
        })
    }
}

/// Builds a connected response head from name/value pairs.
pub fn head(status: u16, headers: &[(&'static str, &str)]) -> ResponseHead {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            map.insert(HeaderName::from_static(name), value);
        }
    }
    ResponseHead::connected(status, map)
}
