//! Alternate engine strategy.
//!
//! The alternate engine has no shared control port. A fresh instance is
//! launched per asset with its HTTP gateway on a random port, and the data
//! URL is built from that port. The alternate port is tried first so an engine
//! that does speak the control protocol there can be used as-is.

use std::io::ErrorKind;
use std::ops::Range;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::TcpStream;
use url::Url;

use super::handshake::ControlChannel;
use super::{ControlError, ControlState, ControlStrategy, LinkContext};
use crate::launcher::{LaunchRegistry, LaunchRequest};

/// Strategy for per-asset engines reached over an HTTP gateway.
#[derive(Debug)]
pub struct GatewayStrategy {
    asset: String,
    tracker: String,
    gateway_path: String,
    registry: LaunchRegistry,
    channel: ControlChannel,
}

impl GatewayStrategy {
    pub fn new(asset: &str, tracker: &str, gateway_path: &str, registry: LaunchRegistry) -> Self {
        Self {
            asset: asset.to_string(),
            tracker: tracker.to_string(),
            gateway_path: gateway_path.to_string(),
            registry,
            channel: ControlChannel::new(),
        }
    }

    async fn launch_gateway(&self, ctx: &LinkContext) -> Result<Url, ControlError> {
        if let Some(port) = self.registry.running_port(&self.asset) {
            // Still starting from an earlier attempt; nothing to do but wait
            // for the session to be cancelled.
            tracing::debug!(
                "Alternate engine for {} already launched on port {}",
                self.asset,
                port
            );
            ctx.enter_state(ControlState::RetryWait);
            return std::future::pending().await;
        }

        let port = pick_gateway_port(&ctx.config.gateway_port_range);
        ctx.enter_state(ControlState::Launching);
        ctx.launcher
            .launch(&LaunchRequest::Alternate {
                tracker: self.tracker.clone(),
                gateway_port: port,
            })
            .await
            .map_err(|e| ControlError::EngineLaunchFailure {
                reason: e.to_string(),
            })?;
        self.registry.mark_running(&self.asset, port);

        ctx.enter_state(ControlState::RetryWait);
        tokio::time::sleep(ctx.config.retry_backoff).await;
        ctx.ensure_running()?;

        gateway_url(&ctx.config.host, port, &self.gateway_path)
    }
}

#[async_trait]
impl ControlStrategy for GatewayStrategy {
    async fn establish(&mut self, ctx: &LinkContext) -> Result<Url, ControlError> {
        ctx.ensure_running()?;

        if !self.channel.is_attached() {
            ctx.enter_state(ControlState::Connecting);
            let address = format!("{}:{}", ctx.config.host, ctx.config.alternate_port);

            match TcpStream::connect(address.as_str()).await {
                Ok(stream) => {
                    tracing::debug!("Engine answered on alternate port {}", address);
                    self.channel.attach(stream);
                }
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    return self.launch_gateway(ctx).await;
                }
                Err(e) => {
                    return Err(ControlError::Io {
                        reason: format!("{address}: {e}"),
                    });
                }
            }
        }

        self.channel.negotiate(ctx, &self.asset).await
    }

    /// The alternate engine has no termination directive.
    async fn shutdown(&mut self) -> bool {
        self.channel.close();
        false
    }

    fn close(&mut self) {
        self.channel.close();
    }
}

fn pick_gateway_port(range: &Range<u16>) -> u16 {
    if range.is_empty() {
        return range.start;
    }
    rand::rng().random_range(range.clone())
}

/// `http://<host>:<port>/<root hash>@<duration>`
fn gateway_url(host: &str, port: u16, gateway_path: &str) -> Result<Url, ControlError> {
    let raw = format!("http://{host}:{port}/{gateway_path}");
    Url::parse(&raw).map_err(|e| ControlError::ProtocolError {
        message: format!("unusable gateway url {raw:?}: {e}"),
    })
}
