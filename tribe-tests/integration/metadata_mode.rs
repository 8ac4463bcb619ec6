//! Metadata-mode sessions over a real gateway connection.

use std::sync::Arc;

use tribe_core::test_mocks::{ConsumerEvent, MockLauncher, RecordingConsumer};
use tribe_core::{ForwarderKind, RequestIdentity, ResponseMetadata, StopStatus};
use tribe_sim::{
    EngineBehavior, MirrorMode, SimulatedEngine, SimulatedGateway, SimulatedMirror, asset_bytes,
};

use crate::support::{WAIT, config, context};

#[tokio::test]
async fn test_metadata_session_reports_engine_response() {
    let asset = asset_bytes(3000);
    let gateway = SimulatedGateway::start(asset.clone(), asset.len() as u64)
        .await
        .unwrap();
    let engine = SimulatedEngine::start(EngineBehavior::Play(gateway.url()))
        .await
        .unwrap();

    let ctx = context(config(engine.port()).await, MockLauncher::new());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session("tribe://http://tracker.example/feed.torrent;xmlhttp")
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert!(handle.is_metadata_mode());

    assert_eq!(consumer.wait_for_stop(WAIT).await, Some(StopStatus::Success));
    assert_eq!(handle.forwarder_kind(), Some(ForwarderKind::MetadataShadowed));
    assert_eq!(handle.response_status(), Some(200));
    assert_eq!(handle.content_type().as_deref(), Some("video/ogg"));
    assert_eq!(handle.response_header("Content-Length").as_deref(), Some("3000"));
    assert_eq!(handle.request_method(), "GET");
    assert_eq!(consumer.body().len(), 3000);

    let presented = handle.presented_uri().unwrap();
    assert!(presented.starts_with("http://127.0.0.1:"));
    assert!(handle.original_uri().is_some());

    let session_id = handle.id();
    assert!(consumer.events().iter().all(|event| match event {
        ConsumerEvent::Start { request, .. }
        | ConsumerEvent::Data { request, .. }
        | ConsumerEvent::Stop { request, .. } => *request == RequestIdentity::Session(session_id),
    }));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_metadata_session_ignores_fallback_mirror() {
    let asset = asset_bytes(10_000);
    let gateway = SimulatedGateway::start(asset.slice(..4000), asset.len() as u64)
        .await
        .unwrap();
    let mirror = SimulatedMirror::start(asset.clone(), MirrorMode::Honour)
        .await
        .unwrap();
    let engine = SimulatedEngine::start(EngineBehavior::Play(gateway.url()))
        .await
        .unwrap();

    let ctx = context(config(engine.port()).await, MockLauncher::new());
    let descriptor = format!(
        "tribe://http://tracker.example/feed.torrent|{};xmlhttp",
        mirror.url()
    );
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(&descriptor)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert_eq!(consumer.wait_for_stop(WAIT).await, Some(StopStatus::Success));
    assert_eq!(handle.forwarder_kind(), Some(ForwarderKind::MetadataShadowed));
    assert_eq!(consumer.body().len(), 4000);
    assert_eq!(mirror.request_count(), 0);

    handle.shutdown().await;
}
