//! End-to-end failover scenario.
//!
//! An engine announces a stream of `length` bytes, its gateway delivers only
//! the first `deliver`, and a mirror holding the full asset is configured as
//! fallback. The scenario opens a real session over loopback and reports
//! what the consumer received.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tribe_core::test_mocks::{MockLauncher, RecordingConsumer};
use tribe_core::{HttpFetcher, SessionContext, StopStatus, TribeConfig};

use crate::{
    EngineBehavior, MirrorMode, SimError, SimulatedEngine, SimulatedGateway, SimulatedMirror,
    asset_bytes,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct FailoverScenario {
    pub length: usize,
    pub deliver: usize,
    pub mirror: MirrorMode,
    pub timeout: Duration,
}

/// What the consumer saw.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub declared_length: usize,
    pub engine_delivered: usize,
    pub mirror_mode: MirrorMode,
    pub forwarder: Option<String>,
    pub delivered_bytes: usize,
    /// Consumer received exactly the asset
    pub intact: bool,
    /// Everything received sits at its correct offset, nothing repeated
    pub prefix_consistent: bool,
    pub stop_count: usize,
    pub outcome: String,
    pub failed_over: bool,
    pub mirror_ranges: Vec<Option<String>>,
    pub engine_shutdowns: usize,
}

impl ScenarioReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == "success"
    }
}

impl FailoverScenario {
    pub fn new(length: usize, deliver: usize, mirror: MirrorMode) -> Self {
        Self {
            length,
            deliver,
            mirror,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the scenario to the consumer's final stop.
    ///
    /// # Errors
    /// - `SimError::InvalidScenario` - More bytes delivered than declared
    /// - `SimError::Io` - A simulated server could not start
    /// - `SimError::Client` - HTTP client settings were rejected
    /// - `SimError::Timeout` - No final stop within the timeout
    pub async fn run(&self) -> Result<ScenarioReport, SimError> {
        if self.deliver > self.length {
            return Err(SimError::InvalidScenario {
                reason: format!(
                    "cannot deliver {} of {} declared bytes",
                    self.deliver, self.length
                ),
            });
        }

        let asset = asset_bytes(self.length);
        let gateway =
            SimulatedGateway::start(asset.slice(..self.deliver), self.length as u64).await?;
        let mirror = SimulatedMirror::start(asset.clone(), self.mirror).await?;
        let engine = SimulatedEngine::start(EngineBehavior::Play(gateway.url())).await?;

        let mut config = TribeConfig::for_testing();
        config.engine.primary_port = engine.port();
        let fetcher = Arc::new(HttpFetcher::new(&config.network)?);
        let ctx = SessionContext::new(config, Arc::new(MockLauncher::new()), fetcher);

        let descriptor = format!("tribe://http://tracker.sim/asset.torrent|{}", mirror.url());
        let consumer = RecordingConsumer::new();
        let handle = ctx.session(&descriptor)?.open(Arc::new(consumer.clone()));

        let Some(status) = consumer.wait_for_stop(self.timeout).await else {
            handle.cancel().await;
            return Err(SimError::Timeout {
                seconds: self.timeout.as_secs(),
            });
        };
        handle.shutdown().await;
        engine.wait_for_closes(1, Duration::from_secs(1)).await;

        let body = consumer.body();
        let prefix_consistent = asset.starts_with(&body);
        let outcome = match status {
            StopStatus::Success => "success".to_string(),
            StopStatus::Failure { reason } => format!("failure: {reason}"),
        };
        let mirror_ranges = mirror.range_requests();

        tracing::info!(
            "Scenario {}/{} with {} mirror: {} ({} bytes)",
            self.deliver,
            self.length,
            self.mirror,
            outcome,
            body.len()
        );

        Ok(ScenarioReport {
            declared_length: self.length,
            engine_delivered: self.deliver,
            mirror_mode: self.mirror,
            forwarder: handle.forwarder_kind().map(|kind| kind.to_string()),
            delivered_bytes: body.len(),
            intact: prefix_consistent && body.len() == self.length,
            prefix_consistent,
            stop_count: consumer.stops().len(),
            outcome,
            failed_over: !mirror_ranges.is_empty(),
            mirror_ranges,
            engine_shutdowns: engine.shutdown_count(),
        })
    }
}
