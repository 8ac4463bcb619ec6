//! Shared setup for integration tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tribe_core::SessionHandle;
use tribe_core::test_mocks::{ConsumerEvent, MockLauncher, RecordingConsumer};
use tribe_core::{HttpFetcher, SessionContext, TribeConfig};

pub const WAIT: Duration = Duration::from_secs(10);

/// Loopback port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Testing config aimed at `engine_port`, with the dead-end URL on a
/// closed loopback port so failed opens are refused immediately.
pub async fn config(engine_port: u16) -> TribeConfig {
    let mut config = TribeConfig::for_testing();
    config.engine.primary_port = engine_port;
    config.engine.alternate_port = unused_port().await;
    config.failover.dead_end_url = format!(
        "http://127.0.0.1:{}/createxpierror.html",
        unused_port().await
    );
    config
}

pub fn context(config: TribeConfig, launcher: MockLauncher) -> SessionContext {
    let fetcher = Arc::new(HttpFetcher::new(&config.network).unwrap());
    SessionContext::new(config, Arc::new(launcher), fetcher)
}

/// Checks that data offsets are contiguous from zero and returns the total.
pub fn assert_contiguous(consumer: &RecordingConsumer) -> u64 {
    let mut next = 0u64;
    for event in consumer.events() {
        if let ConsumerEvent::Data { offset, len, .. } = event {
            assert_eq!(offset, next, "gap or overlap at offset {offset}");
            next += len as u64;
        }
    }
    next
}

/// Polls until the session's control state satisfies `predicate`.
pub async fn wait_for_state(
    handle: &SessionHandle,
    predicate: impl Fn(tribe_core::ControlState) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if predicate(handle.state()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
