//! reqwest-backed data connections.

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::RANGE;

use super::{DataFetcher, EventSink, FetchRequest, ResponseHead, UpstreamConnection};
use crate::TribeError;
use crate::config::NetworkConfig;
use crate::consumer::StopStatus;

/// Fetcher backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds the client with the configured timeout, user agent and proxy
    /// policy.
    ///
    /// # Errors
    /// - `TribeError::Configuration` - reqwest rejected the client settings
    pub fn new(config: &NetworkConfig) -> Result<Self, TribeError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent);
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }

        let client = builder.build().map_err(|e| TribeError::Configuration {
            reason: format!("HTTP client: {e}"),
        })?;

        Ok(Self { client })
    }
}

impl DataFetcher for HttpFetcher {
    fn open(&self, request: FetchRequest) -> UpstreamConnection {
        let client = self.client.clone();
        UpstreamConnection::spawn(move |sink| drive_http(client, request, sink))
    }
}

async fn drive_http(client: reqwest::Client, request: FetchRequest, sink: EventSink) {
    let mut builder = client.get(request.url.clone());
    if let Some(range) = request.range_header() {
        builder = builder.header(RANGE, range);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            let reason = if e.is_connect() {
                format!("Failed to connect: {}", request.url)
            } else if e.is_timeout() {
                format!("Request timed out: {}", request.url)
            } else {
                format!("Request failed: {e}")
            };
            tracing::debug!("Data connection to {} failed: {}", request.url, e);
            if sink.start(ResponseHead::failed(reason.clone())).await {
                sink.stop(StopStatus::failure(reason)).await;
            }
            return;
        }
    };

    let status = response.status();
    let head = ResponseHead::connected(status.as_u16(), response.headers().clone());
    if !sink.start(head).await {
        return;
    }

    if !status.is_success() {
        tracing::debug!("Data connection to {} returned {}", request.url, status);
        sink.stop(StopStatus::failure(status_reason(status))).await;
        return;
    }

    let mut offset = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                let len = bytes.len() as u64;
                if !sink.data(offset, bytes).await {
                    return;
                }
                offset += len;
            }
            Err(e) => {
                tracing::debug!(
                    "Data connection to {} broke after {} bytes: {}",
                    request.url,
                    offset,
                    e
                );
                sink.stop(StopStatus::failure(format!("Body read failed: {e}")))
                    .await;
                return;
            }
        }
    }

    sink.stop(StopStatus::Success).await;
}

fn status_reason(status: StatusCode) -> String {
    format!("HTTP {}", status.as_u16())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use url::Url;

    use super::*;
    use crate::upstream::EventKind;

    async fn collect(mut connection: UpstreamConnection) -> Vec<EventKind> {
        let mut events = Vec::new();
        while let Some(event) = connection.next_event().await {
            events.push(event.kind);
        }
        events
    }

    /// Serves one raw HTTP response and returns the request it received.
    async fn serve_once(response: &'static [u8]) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/asset", listener.local_addr().unwrap())).unwrap();

        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let read = stream.read(&mut request).await.unwrap();
            stream.write_all(response).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request[..read]).to_string()
        });

        (url, task)
    }

    #[tokio::test]
    async fn test_http_fetcher_streams_body_with_offsets() {
        let (url, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                .await;
        let fetcher = HttpFetcher::new(&crate::TribeConfig::for_testing().network).unwrap();

        let events = collect(fetcher.open(FetchRequest::whole(url))).await;
        server.await.unwrap();

        let EventKind::Start(head) = &events[0] else {
            panic!("expected start, got {:?}", events[0]);
        };
        assert_eq!(head.content_length(), Some(5));

        let mut body = Vec::new();
        for event in &events[1..events.len() - 1] {
            let EventKind::Data { offset, bytes } = event else {
                panic!("expected data, got {event:?}");
            };
            assert_eq!(*offset as usize, body.len());
            body.extend_from_slice(bytes);
        }
        assert_eq!(body, b"hello");
        assert!(matches!(
            events.last(),
            Some(EventKind::Stop(StopStatus::Success))
        ));
    }

    #[tokio::test]
    async fn test_http_fetcher_sends_range_header() {
        let (url, server) = serve_once(
            b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 3-4/5\r\nContent-Length: 2\r\nConnection: close\r\n\r\nlo",
        )
        .await;
        let fetcher = HttpFetcher::new(&crate::TribeConfig::for_testing().network).unwrap();

        let events = collect(fetcher.open(FetchRequest::from_offset(url, 3))).await;
        let request = server.await.unwrap().to_lowercase();

        assert!(request.contains("range: bytes=3-"));
        let EventKind::Start(head) = &events[0] else {
            panic!("expected start");
        };
        assert_eq!(head.status(), Some(206));
        assert_eq!(head.content_range(), Some("bytes 3-4/5"));
    }

    #[tokio::test]
    async fn test_http_fetcher_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{addr}/missing")).unwrap();
        let fetcher = HttpFetcher::new(&crate::TribeConfig::for_testing().network).unwrap();
        let events = collect(fetcher.open(FetchRequest::whole(url))).await;

        assert_eq!(events.len(), 2);
        let EventKind::Start(head) = &events[0] else {
            panic!("expected start");
        };
        assert!(!head.is_connected());
        assert!(matches!(
            events[1],
            EventKind::Stop(StopStatus::Failure { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_fetcher_fails_on_error_status() {
        let (url, server) =
            serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        let fetcher = HttpFetcher::new(&crate::TribeConfig::for_testing().network).unwrap();

        let events = collect(fetcher.open(FetchRequest::whole(url))).await;
        server.await.unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            EventKind::Stop(StopStatus::Failure { reason }) if reason == "HTTP 404"
        ));
    }

    #[test]
    fn test_rejected_client_settings_fail_construction() {
        let config = NetworkConfig {
            user_agent: "tribe\n",
            ..crate::TribeConfig::for_testing().network
        };

        let result = HttpFetcher::new(&config);
        assert!(matches!(
            result,
            Err(TribeError::Configuration { ref reason }) if reason.starts_with("HTTP client")
        ));
    }
}
