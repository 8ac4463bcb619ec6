//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Subcommand;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tribe_core::{
    RequestIdentity, ResponseHead, SessionContext, StopStatus, StreamConsumer, TribeConfig,
    TribeError,
};
#[cfg(feature = "simulation")]
use tribe_sim::{FailoverScenario, MirrorMode};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a source descriptor through the local engine
    Play {
        /// `[tribe://]<primary>[|<fallback>][;xmlhttp]`
        descriptor: String,
        /// Write the stream here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a failover scenario against simulated engine, gateway and mirror
    #[cfg(feature = "simulation")]
    Simulate {
        /// Length the engine announces
        #[arg(long, default_value = "1048576")]
        length: usize,
        /// Bytes the engine delivers before stopping
        #[arg(long, default_value = "400000")]
        deliver: usize,
        /// How the mirror treats range requests (honour, ignore, missing)
        #[arg(long, default_value = "honour")]
        mirror: MirrorMode,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Play { descriptor, output } => play(descriptor, output).await,
        #[cfg(feature = "simulation")]
        Commands::Simulate {
            length,
            deliver,
            mirror,
        } => simulate(length, deliver, mirror).await,
    }
}

/// Consumer writing the stream to a file or stdout.
struct OutputConsumer {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    written: AtomicU64,
    stopped: watch::Sender<Option<StopStatus>>,
}

impl OutputConsumer {
    fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        let (stopped, _) = watch::channel(None);
        Self {
            writer: Mutex::new(writer),
            written: AtomicU64::new(0),
            stopped,
        }
    }

    fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StreamConsumer for OutputConsumer {
    async fn on_start(&self, request: RequestIdentity, head: &ResponseHead) {
        match head.status() {
            Some(status) => tracing::info!(
                "Stream started ({:?}): HTTP {}, {} bytes, {}",
                request,
                status,
                head.content_length()
                    .map_or_else(|| "unknown".to_string(), |len| len.to_string()),
                head.content_type().unwrap_or("no content type")
            ),
            None => tracing::warn!("Stream could not be opened"),
        }
    }

    async fn on_data(&self, _request: RequestIdentity, offset: u64, data: Bytes) {
        let len = data.len() as u64;
        if let Err(e) = self.writer.lock().await.write_all(&data).await {
            tracing::error!("Failed to write {} bytes at {}: {}", len, offset, e);
            return;
        }
        self.written.fetch_add(len, Ordering::Relaxed);
    }

    async fn on_stop(&self, _request: RequestIdentity, status: StopStatus) {
        if let Err(e) = self.writer.lock().await.flush().await {
            tracing::error!("Failed to flush output: {}", e);
        }
        self.stopped.send_replace(Some(status));
    }
}

/// Play a descriptor into `output` or stdout
async fn play(descriptor: String, output: Option<PathBuf>) -> anyhow::Result<()> {
    let config = TribeConfig::from_env();
    config.validate().map_err(report)?;

    let writer: Box<dyn AsyncWrite + Send + Unpin> = match &output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let ctx = SessionContext::production(config).map_err(report)?;
    let session = ctx
        .session(&descriptor)
        .map_err(|e| report(TribeError::from(e)))?;
    let consumer = Arc::new(OutputConsumer::new(writer));
    let mut stopped = consumer.stopped.subscribe();
    let handle = session.open(consumer.clone());

    let status = tokio::select! {
        result = stopped.wait_for(Option::is_some) => result.ok().and_then(|status| status.clone()),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down engine");
            None
        }
    };
    handle.shutdown().await;

    match status {
        Some(StopStatus::Success) => {
            tracing::info!("Stream complete, {} bytes written", consumer.written());
            Ok(())
        }
        Some(StopStatus::Failure { reason }) => {
            bail!(
                "Stream failed after {} bytes: {}",
                consumer.written(),
                reason
            )
        }
        None => bail!("Stream interrupted after {} bytes", consumer.written()),
    }
}

/// Run one failover scenario and print its report as JSON
#[cfg(feature = "simulation")]
async fn simulate(length: usize, deliver: usize, mirror: MirrorMode) -> anyhow::Result<()> {
    println!(
        "Simulating {deliver} of {length} bytes from the engine, mirror mode {mirror}"
    );

    let report = FailoverScenario::new(length, deliver, mirror)
        .run()
        .await
        .context("Simulation failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.intact {
        println!("Consumer received the complete asset");
    } else {
        println!(
            "Consumer received {} of {} bytes ({})",
            report.delivered_bytes, report.declared_length, report.outcome
        );
    }

    Ok(())
}

fn report(error: TribeError) -> anyhow::Error {
    tracing::error!("{}", error);
    anyhow::anyhow!(error.user_message())
}
