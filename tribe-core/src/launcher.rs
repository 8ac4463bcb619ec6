//! Starting engine processes on demand.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::EngineConfig;

/// Directory under the install dir holding engine binaries.
const ENGINE_DIR: &str = "bgprocess";

/// Errors from starting an engine process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("Engine binary not found: {path}")]
    BinaryMissing { path: String },

    #[error("Failed to start engine {path}: {reason}")]
    SpawnFailed { path: String, reason: String },
}

/// Which engine to start and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchRequest {
    /// Shared engine reached over the control protocol.
    Primary { debug: bool },
    /// Per-asset engine serving an HTTP gateway on `gateway_port`.
    Alternate { tracker: String, gateway_port: u16 },
}

/// Starts engines when the control connection is refused.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Starts the engine and returns once the process has been spawned.
    /// Does not wait for it to accept connections.
    ///
    /// # Errors
    /// - `LaunchError::BinaryMissing` - No engine binary at the expected path
    /// - `LaunchError::SpawnFailed` - The OS refused to start the process
    async fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError>;
}

/// Platform flavours with distinct engine packaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Windows,
    MacOs,
    Other,
}

impl TargetOs {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            TargetOs::Windows
        } else if cfg!(target_os = "macos") {
            TargetOs::MacOs
        } else {
            TargetOs::Other
        }
    }
}

/// Launches engine binaries shipped in `<install dir>/bgprocess/`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    install_dir: PathBuf,
    os: TargetOs,
}

impl ProcessLauncher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            install_dir: config.install_dir.clone(),
            os: TargetOs::current(),
        }
    }

    /// Overrides platform detection.
    pub fn with_os(mut self, os: TargetOs) -> Self {
        self.os = os;
        self
    }

    pub fn binary_path(&self, request: &LaunchRequest) -> PathBuf {
        let name = match (request, self.os) {
            (LaunchRequest::Primary { .. }, TargetOs::Windows) => "SwarmEngine.exe",
            (LaunchRequest::Primary { .. }, TargetOs::MacOs) => {
                "SwarmPlayer.app/Contents/MacOS/SwarmPlayer"
            }
            (LaunchRequest::Primary { .. }, TargetOs::Other) => "swarmengined",
            (LaunchRequest::Alternate { .. }, TargetOs::Windows) => "swift.exe",
            (LaunchRequest::Alternate { .. }, _) => "swift",
        };
        self.install_dir.join(ENGINE_DIR).join(name)
    }

    pub fn arguments(&self, request: &LaunchRequest) -> Vec<String> {
        match request {
            // The macOS bundle does not accept the debug switch
            LaunchRequest::Primary { debug } if *debug && self.os != TargetOs::MacOs => {
                vec!["debug".to_string()]
            }
            LaunchRequest::Primary { .. } => Vec::new(),
            LaunchRequest::Alternate {
                tracker,
                gateway_port,
            } => vec![
                "-t".to_string(),
                tracker.clone(),
                "-g".to_string(),
                format!("0.0.0.0:{gateway_port}"),
                "-w".to_string(),
            ],
        }
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        let path = self.binary_path(request);
        if !path.exists() {
            return Err(LaunchError::BinaryMissing {
                path: path.display().to_string(),
            });
        }

        let args = self.arguments(request);
        tracing::info!("Launching engine {} {:?}", path.display(), args);

        let mut child = tokio::process::Command::new(&path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        // The engine outlives the session; reap it whenever it exits.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!("Engine process exited: {}", status),
                Err(e) => tracing::warn!("Lost track of engine process: {}", e),
            }
        });

        Ok(())
    }
}

/// Alternate engine instances started by this process, keyed by asset.
///
/// Clones share the same table. Entries are never removed: a launched
/// engine outlives the session that started it.
#[derive(Debug, Clone, Default)]
pub struct LaunchRegistry {
    running: Arc<Mutex<HashMap<String, u16>>>,
}

impl LaunchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_running(&self, asset: &str, gateway_port: u16) {
        self.running.lock().insert(asset.to_string(), gateway_port);
    }

    /// Gateway port of the instance started for `asset`, if any.
    pub fn running_port(&self, asset: &str) -> Option<u16> {
        self.running.lock().get(asset).copied()
    }
}
