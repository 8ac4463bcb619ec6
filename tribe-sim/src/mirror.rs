//! Simulated HTTP mirror holding a complete copy of the asset.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;

/// How the mirror treats range requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMode {
    /// 206 with the requested tail and a `Content-Range`
    Honour,
    /// 200 with the whole asset
    Ignore,
    /// 404
    Missing,
}

impl FromStr for MirrorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "honour" | "honor" => Ok(MirrorMode::Honour),
            "ignore" => Ok(MirrorMode::Ignore),
            "missing" => Ok(MirrorMode::Missing),
            _ => Err(format!(
                "Invalid mirror mode '{s}'. Valid options: honour, ignore, missing"
            )),
        }
    }
}

impl fmt::Display for MirrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorMode::Honour => write!(f, "honour"),
            MirrorMode::Ignore => write!(f, "ignore"),
            MirrorMode::Missing => write!(f, "missing"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedMirror {
    addr: SocketAddr,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

#[derive(Clone)]
struct MirrorState {
    asset: Bytes,
    mode: MirrorMode,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

impl SimulatedMirror {
    /// Starts a mirror serving `asset` on a free loopback port.
    ///
    /// # Errors
    /// - `std::io::Error` - Could not bind the listener
    pub async fn start(asset: Bytes, mode: MirrorMode) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let ranges = Arc::new(Mutex::new(Vec::new()));
        tracing::debug!("Simulated mirror on {} ({} mode)", addr, mode);

        let app = Router::new()
            .route("/video.ogg", get(serve_asset))
            .with_state(MirrorState {
                asset,
                mode,
                ranges: ranges.clone(),
            });

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Simulated mirror stopped: {}", e);
            }
        });

        Ok(Self { addr, ranges })
    }

    pub fn url(&self) -> String {
        format!("http://{}/video.ogg", self.addr)
    }

    /// `Range` header of every request received, `None` where absent.
    pub fn range_requests(&self) -> Vec<Option<String>> {
        self.ranges.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.ranges.lock().len()
    }
}

async fn serve_asset(State(state): State<MirrorState>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().push(range.clone());

    let total = state.asset.len();
    let start = range.as_deref().and_then(|range| satisfiable_start(range, total));

    let response = match (state.mode, start) {
        (MirrorMode::Missing, _) => return StatusCode::NOT_FOUND.into_response(),
        (MirrorMode::Honour, Some(start)) => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, "video/ogg")
            .header(header::CONTENT_LENGTH, (total - start).to_string())
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, total - 1, total),
            )
            .body(Body::from(state.asset.slice(start..))),
        _ => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/ogg")
            .header(header::CONTENT_LENGTH, total.to_string())
            .body(Body::from(state.asset)),
    };

    response.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Start offset of a `bytes=<start>-` range that falls inside the asset.
fn satisfiable_start(range: &str, length: usize) -> Option<usize> {
    let start = range
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .trim()
        .parse::<usize>()
        .ok()?;
    (start < length).then_some(start)
}
