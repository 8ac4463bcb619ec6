//! Per-asset engines reached over their HTTP gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use tribe_core::launcher::LaunchRequest;
use tribe_core::source::BackendKind;
use tribe_core::test_mocks::{MockLauncher, RecordingConsumer};
use tribe_core::{ControlState, SourceDescriptor, StopStatus};
use tribe_sim::{SimulatedGateway, asset_bytes};

use crate::support::{WAIT, config, context, unused_port, wait_for_state};

const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

fn descriptor() -> String {
    format!("tracker.example:20000/{HASH}@3600")
}

/// Launcher that brings up a gateway on whatever port it is asked for.
fn gateway_launcher(body_length: usize) -> (MockLauncher, Arc<Mutex<Vec<SimulatedGateway>>>) {
    let gateways = Arc::new(Mutex::new(Vec::new()));
    let started = gateways.clone();
    let launcher = MockLauncher::with_hook(move |request| {
        let started = started.clone();
        async move {
            let LaunchRequest::Alternate { gateway_port, .. } = request else {
                return;
            };
            let asset = asset_bytes(body_length);
            let addr = SocketAddr::from(([127, 0, 0, 1], gateway_port));
            match SimulatedGateway::bind(addr, asset, body_length as u64).await {
                Ok(gateway) => started.lock().push(gateway),
                Err(e) => tracing::warn!("Simulated gateway did not start: {}", e),
            }
        }
    });
    (launcher, gateways)
}

#[tokio::test]
async fn test_gateway_engine_launched_when_engine_port_refuses() {
    let (launcher, gateways) = gateway_launcher(4096);
    let gateway_port = unused_port().await;
    let mut config = config(unused_port().await).await;
    config.engine.gateway_port_range = gateway_port..gateway_port + 1;

    let ctx = context(config, launcher.clone());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(&descriptor())
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert_eq!(consumer.wait_for_stop(WAIT).await, Some(StopStatus::Success));
    assert_eq!(consumer.body(), asset_bytes(4096).to_vec());
    assert_eq!(
        launcher.requests(),
        vec![LaunchRequest::Alternate {
            tracker: "tracker.example:20000".to_string(),
            gateway_port,
        }]
    );

    let gateways = gateways.lock().clone();
    assert_eq!(gateways.len(), 1);
    assert_eq!(gateways[0].port(), gateway_port);
    assert_eq!(gateways[0].requested_paths(), vec![format!("/{HASH}@3600")]);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_second_session_for_launched_asset_waits_without_relaunch() {
    let (launcher, _gateways) = gateway_launcher(1024);
    let gateway_port = unused_port().await;
    let mut config = config(unused_port().await).await;
    config.engine.gateway_port_range = gateway_port..gateway_port + 1;
    let ctx = context(config, launcher.clone());

    let first = RecordingConsumer::new();
    let first_handle = ctx
        .session(&descriptor())
        .unwrap()
        .open(Arc::new(first.clone()));
    assert_eq!(first.wait_for_stop(WAIT).await, Some(StopStatus::Success));

    let second = RecordingConsumer::new();
    let second_handle = ctx
        .session(&descriptor())
        .unwrap()
        .open(Arc::new(second.clone()));
    assert!(wait_for_state(&second_handle, |state| state == ControlState::RetryWait).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(launcher.launch_count(), 1);
    assert!(second.events().is_empty());
    assert_eq!(second_handle.forwarder_kind(), None);

    second_handle.cancel().await;
    assert!(wait_for_state(&second_handle, |state| state == ControlState::ShuttingDown).await);
    assert!(second.events().is_empty());

    first_handle.shutdown().await;
}

#[tokio::test]
async fn test_gateway_launch_failure_fails_the_open() {
    let mut config = config(unused_port().await).await;
    let gateway_port = unused_port().await;
    config.engine.gateway_port_range = gateway_port..gateway_port + 1;

    let launcher = MockLauncher::new_with_launch_failure();
    let ctx = context(config, launcher.clone());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(&descriptor())
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert!(matches!(
        consumer.wait_for_stop(WAIT).await,
        Some(StopStatus::Failure { .. })
    ));
    assert_eq!(consumer.data_count(), 0);
    assert_eq!(handle.state(), ControlState::Errored);
    assert_eq!(launcher.launch_count(), 1);
}

proptest! {
    #[test]
    fn test_hash_and_duration_select_gateway_backend(
        hash in "[0-9a-f]{40}",
        duration in 1u32..100_000,
        tracker in "[a-z]{1,12}\\.example:[0-9]{2,5}",
    ) {
        let primary = format!("{tracker}/{hash}@{duration}");
        let source = SourceDescriptor::parse(&format!("tribe://{primary}")).unwrap();

        prop_assert_eq!(source.primary(), primary.as_str());
        prop_assert_eq!(
            source.backend(),
            &BackendKind::Alternate {
                tracker,
                gateway_path: format!("{hash}@{duration}"),
            }
        );
    }

    #[test]
    fn test_torrent_urls_select_control_backend(name in "[a-z0-9]{1,30}") {
        let source = SourceDescriptor::parse(&format!("http://tracker.example/{name}.torrent")).unwrap();
        prop_assert_eq!(source.backend(), &BackendKind::Primary);
        prop_assert!(source.fallback().is_none());
    }
}
