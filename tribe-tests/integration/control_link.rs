//! Control link behaviour against a simulated engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tribe_core::test_mocks::{MockLauncher, RecordingConsumer};
use tribe_core::{ControlState, ForwarderKind, StopStatus};
use tribe_sim::{EngineBehavior, SimulatedEngine, SimulatedGateway, asset_bytes};

use crate::support::{WAIT, assert_contiguous, config, context, unused_port, wait_for_state};

const DESCRIPTOR: &str = "http://tracker.example/movie.torrent";

#[tokio::test]
async fn test_refused_engine_is_launched_then_played() {
    let asset = asset_bytes(8192);
    let gateway = SimulatedGateway::start(asset.clone(), asset.len() as u64)
        .await
        .unwrap();
    let port = unused_port().await;

    let engine: Arc<Mutex<Option<SimulatedEngine>>> = Arc::new(Mutex::new(None));
    let launched = engine.clone();
    let url = gateway.url();
    let launcher = MockLauncher::with_hook(move |_request| {
        let launched = launched.clone();
        let url = url.clone();
        async move {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            match SimulatedEngine::bind(addr, EngineBehavior::Play(url)).await {
                Ok(started) => *launched.lock() = Some(started),
                Err(e) => tracing::warn!("Simulated engine did not start: {}", e),
            }
        }
    });

    let ctx = context(config(port).await, launcher.clone());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert_eq!(consumer.wait_for_stop(WAIT).await, Some(StopStatus::Success));
    assert_eq!(handle.forwarder_kind(), Some(ForwarderKind::Direct));
    assert_eq!(handle.retry_count(), 1);
    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(consumer.start_count(), 1);
    assert_eq!(consumer.stops().len(), 1);
    assert_eq!(Bytes::from(consumer.body()), asset);
    assert_eq!(assert_contiguous(&consumer), 8192);

    let engine = engine.lock().clone().expect("launch hook started the engine");
    assert_eq!(engine.started_assets(), vec![DESCRIPTOR.to_string()]);
    assert_eq!(engine.announced_capabilities().len(), 1);
    assert_eq!(gateway.requested_paths(), vec!["/stream".to_string()]);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_status_chatter_before_play_is_skipped() {
    let asset = asset_bytes(2048);
    let gateway = SimulatedGateway::start(asset.clone(), asset.len() as u64)
        .await
        .unwrap();
    let engine = SimulatedEngine::start(EngineBehavior::NoiseThenPlay(gateway.url()))
        .await
        .unwrap();

    let launcher = MockLauncher::new();
    let ctx = context(config(engine.port()).await, launcher.clone());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert_eq!(consumer.wait_for_stop(WAIT).await, Some(StopStatus::Success));
    assert_eq!(consumer.body().len(), 2048);
    assert_eq!(launcher.launch_count(), 0);
    assert_eq!(handle.retry_count(), 0);
    assert_eq!(handle.state(), ControlState::Playing);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_engine_error_fails_the_open_without_data() {
    let engine = SimulatedEngine::start(EngineBehavior::Error("no peers".to_string()))
        .await
        .unwrap();

    let ctx = context(config(engine.port()).await, MockLauncher::new());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert!(matches!(
        consumer.wait_for_stop(WAIT).await,
        Some(StopStatus::Failure { .. })
    ));
    assert_eq!(consumer.start_count(), 1);
    assert_eq!(consumer.data_count(), 0);
    assert_eq!(consumer.stops().len(), 1);
    assert_eq!(handle.state(), ControlState::Errored);
    assert_eq!(handle.forwarder_kind(), Some(ForwarderKind::Direct));
}

#[tokio::test]
async fn test_engine_hanging_up_fails_the_open() {
    let engine = SimulatedEngine::start(EngineBehavior::CloseSilently)
        .await
        .unwrap();

    let ctx = context(config(engine.port()).await, MockLauncher::new());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert!(matches!(
        consumer.wait_for_stop(WAIT).await,
        Some(StopStatus::Failure { .. })
    ));
    assert_eq!(consumer.data_count(), 0);
    assert_eq!(handle.state(), ControlState::Errored);
}

#[tokio::test]
async fn test_missing_engine_binary_fails_the_open() {
    let port = unused_port().await;
    let launcher = MockLauncher::new_with_launch_failure();
    let ctx = context(config(port).await, launcher.clone());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert!(matches!(
        consumer.wait_for_stop(WAIT).await,
        Some(StopStatus::Failure { .. })
    ));
    assert_eq!(consumer.start_count(), 1);
    assert_eq!(consumer.data_count(), 0);
    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(handle.state(), ControlState::Errored);
}

#[tokio::test]
async fn test_retry_limit_fails_the_open() {
    let port = unused_port().await;
    let launcher = MockLauncher::new();
    let mut config = config(port).await;
    config.engine.max_connect_retries = Some(3);
    config.engine.retry_backoff = Duration::from_millis(5);

    let ctx = context(config, launcher.clone());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert!(matches!(
        consumer.wait_for_stop(WAIT).await,
        Some(StopStatus::Failure { .. })
    ));
    assert_eq!(launcher.launch_count(), 3);
    assert_eq!(handle.retry_count(), 3);
    assert_eq!(handle.state(), ControlState::Errored);
}

#[tokio::test]
async fn test_shutdown_sends_one_directive() {
    let asset = asset_bytes(512);
    let gateway = SimulatedGateway::start(asset.clone(), asset.len() as u64)
        .await
        .unwrap();
    let engine = SimulatedEngine::start(EngineBehavior::Play(gateway.url()))
        .await
        .unwrap();

    let ctx = context(config(engine.port()).await, MockLauncher::new());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));
    consumer.wait_for_stop(WAIT).await;

    handle.shutdown().await;
    handle.shutdown().await;
    handle.clone().shutdown().await;

    assert!(engine.wait_for_closes(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.shutdown_count(), 1);
    assert_eq!(engine.close_count(), 1);
    assert_eq!(engine.connection_count(), 1);
    assert_eq!(handle.state(), ControlState::ShuttingDown);
}

#[tokio::test]
async fn test_cancel_closes_without_directive() {
    let asset = asset_bytes(512);
    let gateway = SimulatedGateway::start(asset.clone(), asset.len() as u64)
        .await
        .unwrap();
    let engine = SimulatedEngine::start(EngineBehavior::Play(gateway.url()))
        .await
        .unwrap();

    let ctx = context(config(engine.port()).await, MockLauncher::new());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));
    consumer.wait_for_stop(WAIT).await;

    handle.cancel().await;

    assert!(engine.wait_for_closes(1, WAIT).await);
    assert_eq!(engine.shutdown_count(), 0);
    assert!(wait_for_state(&handle, |state| state == ControlState::ShuttingDown).await);
}

#[tokio::test]
async fn test_cancel_while_launching_stops_retries() {
    let port = unused_port().await;
    let launcher = MockLauncher::new();
    let mut config = config(port).await;
    config.engine.max_connect_retries = None;

    let ctx = context(config, launcher.clone());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(DESCRIPTOR)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert!(wait_for_state(&handle, |_| handle.retry_count() >= 2).await);
    handle.cancel().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let launches = launcher.launch_count();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(launcher.launch_count(), launches);
    assert!(consumer.events().is_empty());
    assert_eq!(handle.forwarder_kind(), None);
}
