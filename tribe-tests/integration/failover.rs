//! Intra-playback failover from a truncated engine stream to the mirror.

use std::sync::Arc;

use tribe_core::test_mocks::{ConsumerEvent, MockLauncher, RecordingConsumer};
use tribe_core::{ForwarderKind, RequestIdentity, StopStatus};
use tribe_sim::{
    EngineBehavior, FailoverScenario, MirrorMode, SimulatedEngine, SimulatedGateway,
    SimulatedMirror, asset_bytes,
};

use crate::support::{WAIT, assert_contiguous, config, context};

#[tokio::test]
async fn test_short_engine_stream_is_completed_from_mirror() {
    let report = FailoverScenario::new(1_048_576, 400_000, MirrorMode::Honour)
        .run()
        .await
        .unwrap();

    assert!(report.succeeded(), "outcome: {}", report.outcome);
    assert!(report.intact);
    assert_eq!(report.delivered_bytes, 1_048_576);
    assert_eq!(report.stop_count, 1);
    assert!(report.failed_over);
    assert_eq!(report.mirror_ranges, vec![Some("bytes=400000-".to_string())]);
    assert_eq!(report.forwarder.as_deref(), Some("fallback-capable"));
}

#[tokio::test]
async fn test_mirror_without_asset_fails_after_engine_bytes() {
    let report = FailoverScenario::new(65_536, 20_000, MirrorMode::Missing)
        .run()
        .await
        .unwrap();

    assert!(!report.succeeded());
    assert!(report.outcome.starts_with("failure"));
    assert_eq!(report.delivered_bytes, 20_000);
    assert!(report.prefix_consistent);
    assert_eq!(report.stop_count, 1);
    assert_eq!(report.mirror_ranges.len(), 1);
}

#[tokio::test]
async fn test_mirror_ignoring_range_is_not_spliced() {
    let report = FailoverScenario::new(65_536, 20_000, MirrorMode::Ignore)
        .run()
        .await
        .unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.delivered_bytes, 20_000);
    assert!(report.prefix_consistent);
    assert!(!report.intact);
    assert_eq!(report.stop_count, 1);
}

#[tokio::test]
async fn test_complete_engine_stream_never_contacts_mirror() {
    let report = FailoverScenario::new(32_768, 32_768, MirrorMode::Honour)
        .run()
        .await
        .unwrap();

    assert!(report.succeeded(), "outcome: {}", report.outcome);
    assert!(report.intact);
    assert!(!report.failed_over);
    assert!(report.mirror_ranges.is_empty());
}

#[tokio::test]
async fn test_failover_keeps_offsets_contiguous_across_sources() {
    let asset = asset_bytes(100_000);
    let gateway = SimulatedGateway::start(asset.slice(..37_123), asset.len() as u64)
        .await
        .unwrap();
    let mirror = SimulatedMirror::start(asset.clone(), MirrorMode::Honour)
        .await
        .unwrap();
    let engine = SimulatedEngine::start(EngineBehavior::Play(gateway.url()))
        .await
        .unwrap();

    let ctx = context(config(engine.port()).await, MockLauncher::new());
    let descriptor = format!("tribe://http://tracker.example/a.torrent|{}", mirror.url());
    let consumer = RecordingConsumer::new();
    let handle = ctx
        .session(&descriptor)
        .unwrap()
        .open(Arc::new(consumer.clone()));

    assert_eq!(consumer.wait_for_stop(WAIT).await, Some(StopStatus::Success));
    assert_eq!(handle.forwarder_kind(), Some(ForwarderKind::FallbackCapable));
    assert_eq!(assert_contiguous(&consumer), 100_000);
    assert_eq!(consumer.body(), asset.to_vec());

    // One start from the engine connection; the mirror's head is absorbed.
    let starts: Vec<_> = consumer
        .events()
        .into_iter()
        .filter(|event| matches!(event, ConsumerEvent::Start { .. }))
        .collect();
    assert_eq!(starts.len(), 1);
    assert!(matches!(
        starts[0],
        ConsumerEvent::Start {
            request: RequestIdentity::Connection(_),
            status: Some(200),
        }
    ));

    handle.shutdown().await;
    assert!(engine.wait_for_closes(1, WAIT).await);
    assert_eq!(engine.shutdown_count(), 1);
}
