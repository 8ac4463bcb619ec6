//! Simulated engine speaking the control protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tribe_core::control::ControlDirective;

/// How the engine answers a `START`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineBehavior {
    /// `PLAY <url>`
    Play(String),
    /// `ERROR <message>`
    Error(String),
    /// Hang up without answering
    CloseSilently,
    /// Status chatter the client must skip, then `PLAY <url>`
    NoiseThenPlay(String),
}

impl EngineBehavior {
    fn reply(&self) -> Option<String> {
        match self {
            EngineBehavior::Play(url) => Some(ControlDirective::Play(url.clone()).encode()),
            EngineBehavior::Error(message) => Some(ControlDirective::Error(message.clone()).encode()),
            EngineBehavior::CloseSilently => None,
            EngineBehavior::NoiseThenPlay(url) => Some(format!(
                "INFO prebuffering 10%\r\nINFO prebuffering 80%\r\n{}",
                ControlDirective::Play(url.clone()).encode()
            )),
        }
    }
}

#[derive(Debug, Default)]
struct EngineLog {
    capabilities: Mutex<Vec<String>>,
    starts: Mutex<Vec<String>>,
    connections: AtomicUsize,
    shutdowns: AtomicUsize,
    closes: AtomicUsize,
}

/// Control protocol server on loopback.
///
/// Every accepted connection gets the same behavior. Dropping the engine
/// does not stop the server task; it lives until the runtime shuts down.
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    addr: SocketAddr,
    log: Arc<EngineLog>,
}

impl SimulatedEngine {
    /// Starts an engine on a free loopback port.
    ///
    /// # Errors
    /// - `std::io::Error` - Could not bind the listener
    pub async fn start(behavior: EngineBehavior) -> std::io::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)), behavior).await
    }

    /// Starts an engine listening on `addr`.
    ///
    /// # Errors
    /// - `std::io::Error` - Could not bind the listener
    pub async fn bind(addr: SocketAddr, behavior: EngineBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let log = Arc::new(EngineLog::default());
        tracing::debug!("Simulated engine listening on {}", addr);

        let server_log = log.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        server_log.connections.fetch_add(1, Ordering::SeqCst);
                        let log = server_log.clone();
                        let behavior = behavior.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_control(stream, &behavior, &log).await {
                                tracing::debug!("Control connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Simulated engine failed to accept: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self { addr, log })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Capability lists announced by clients, in arrival order.
    pub fn announced_capabilities(&self) -> Vec<String> {
        self.log.capabilities.lock().clone()
    }

    /// Assets named in `START` directives, in arrival order.
    pub fn started_assets(&self) -> Vec<String> {
        self.log.starts.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.log.connections.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.log.shutdowns.load(Ordering::SeqCst)
    }

    /// Control connections closed by either side.
    pub fn close_count(&self) -> usize {
        self.log.closes.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` control connections have closed.
    /// Returns false on timeout.
    pub async fn wait_for_closes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.close_count() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

async fn serve_control(
    stream: TcpStream,
    behavior: &EngineBehavior,
    log: &EngineLog,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let result = async {
        while let Some(line) = lines.next_line().await? {
            match ControlDirective::parse(&line) {
                ControlDirective::Supports(capabilities) => {
                    log.capabilities.lock().push(capabilities);
                }
                ControlDirective::Start(asset) => {
                    log.starts.lock().push(asset);
                    match behavior.reply() {
                        Some(reply) => writer.write_all(reply.as_bytes()).await?,
                        None => {
                            writer.shutdown().await?;
                            return Ok(());
                        }
                    }
                }
                ControlDirective::Shutdown => {
                    log.shutdowns.fetch_add(1, Ordering::SeqCst);
                }
                other => tracing::debug!("Simulated engine ignoring {:?}", other),
            }
        }
        Ok::<(), std::io::Error>(())
    }
    .await;

    log.closes.fetch_add(1, Ordering::SeqCst);
    result
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn handshake(engine: &SimulatedEngine) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(engine.addr()).await.unwrap();
        stream
            .write_all(b"SUPPORTS VIDEVENT_START\r\nSTART http://t.example/a.torrent\r\n")
            .await
            .unwrap();

        let mut reply = vec![0u8; 256];
        let read = stream.read(&mut reply).await.unwrap();
        (stream, String::from_utf8_lossy(&reply[..read]).to_string())
    }

    #[tokio::test]
    async fn test_play_reply_and_shutdown_recorded() {
        let engine = SimulatedEngine::start(EngineBehavior::Play("http://127.0.0.1:9/v".to_string()))
            .await
            .unwrap();

        let (mut stream, reply) = handshake(&engine).await;
        assert_eq!(reply, "PLAY http://127.0.0.1:9/v\r\n");

        stream.write_all(b"SHUTDOWN\r\n").await.unwrap();
        stream.shutdown().await.unwrap();
        assert!(engine.wait_for_closes(1, Duration::from_secs(2)).await);

        assert_eq!(engine.shutdown_count(), 1);
        assert_eq!(engine.announced_capabilities(), vec!["VIDEVENT_START"]);
        assert_eq!(engine.started_assets(), vec!["http://t.example/a.torrent"]);
        assert_eq!(engine.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_close_silently_sends_nothing() {
        let engine = SimulatedEngine::start(EngineBehavior::CloseSilently)
            .await
            .unwrap();

        let (_stream, reply) = handshake(&engine).await;
        assert!(reply.is_empty());
    }
}
