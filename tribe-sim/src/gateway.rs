//! Simulated engine data connection.
//!
//! Serves one body to every request while declaring a `Content-Length` of
//! its own choosing. Declaring more than is delivered reproduces an engine
//! that stops short mid-stream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{StreamExt, future, stream};
use parking_lot::Mutex;
use tokio::net::TcpListener;

/// Pause between the last delivered chunk and cutting the connection.
const CUT_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SimulatedGateway {
    addr: SocketAddr,
    paths: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone)]
struct GatewayState {
    body: Bytes,
    declared_length: u64,
    paths: Arc<Mutex<Vec<String>>>,
}

impl SimulatedGateway {
    /// Starts a gateway on a free loopback port.
    ///
    /// # Errors
    /// - `std::io::Error` - Could not bind the listener
    pub async fn start(body: Bytes, declared_length: u64) -> std::io::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)), body, declared_length).await
    }

    /// Starts a gateway on `addr` that delivers `body` and declares
    /// `declared_length`.
    ///
    /// # Errors
    /// - `std::io::Error` - Could not bind the listener
    pub async fn bind(addr: SocketAddr, body: Bytes, declared_length: u64) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let paths = Arc::new(Mutex::new(Vec::new()));
        tracing::debug!(
            "Simulated gateway on {} delivering {} of {} bytes",
            addr,
            body.len(),
            declared_length
        );

        let app = Router::new().fallback(serve_stream).with_state(GatewayState {
            body,
            declared_length,
            paths: paths.clone(),
        });

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Simulated gateway stopped: {}", e);
            }
        });

        Ok(Self { addr, paths })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// URL of the stream, as an engine would name it in `PLAY`.
    pub fn url(&self) -> String {
        format!("http://{}/stream", self.addr)
    }

    /// Request paths served so far.
    pub fn requested_paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

async fn serve_stream(State(state): State<GatewayState>, uri: Uri) -> Response {
    state.paths.lock().push(uri.path().to_string());

    let body = if (state.body.len() as u64) < state.declared_length {
        short_body(state.body)
    } else {
        Body::from(state.body)
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/ogg")
        .header(header::CONTENT_LENGTH, state.declared_length.to_string())
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Body that ends before the declared length, so the server drops the
/// connection once `delivered` is flushed.
fn short_body(delivered: Bytes) -> Body {
    let data = stream::once(future::ready(Ok::<_, Infallible>(delivered)));
    let cut = stream::once(tokio::time::sleep(CUT_DELAY)).filter_map(|()| future::ready(None));
    Body::from_stream(data.chain(cut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset_bytes;

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn test_full_body_matches_declared_length() {
        let asset = asset_bytes(2048);
        let gateway = SimulatedGateway::start(asset.clone(), 2048).await.unwrap();

        let response = client().get(gateway.url()).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.headers()["content-type"], "video/ogg");
        assert_eq!(response.bytes().await.unwrap(), asset);
        assert_eq!(gateway.requested_paths(), vec!["/stream".to_string()]);
    }

    #[tokio::test]
    async fn test_short_body_stops_after_delivered_bytes() {
        let asset = asset_bytes(1000);
        let gateway = SimulatedGateway::start(asset.slice(..400), 1000).await.unwrap();

        let mut response = client()
            .get(format!("http://127.0.0.1:{}/abc@60", gateway.port()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.headers()["content-length"], "1000");

        let mut received = Vec::new();
        let outcome = loop {
            match response.chunk().await {
                Ok(Some(chunk)) => received.extend_from_slice(&chunk),
                other => break other,
            }
        };

        assert!(outcome.is_err(), "connection should end before 1000 bytes");
        assert_eq!(received, asset.slice(..400).to_vec());
        assert_eq!(gateway.requested_paths(), vec!["/abc@60".to_string()]);
    }
}
