//! Centralized configuration for Tribe.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::TribeError;

/// Central configuration for all Tribe components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TribeConfig {
    pub engine: EngineConfig,
    pub failover: FailoverConfig,
    pub network: NetworkConfig,
}

/// Local engine process and control link configuration.
///
/// Controls where the engine is reached, how it is launched when absent,
/// and how connection attempts are retried.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Host the engine listens on for control and data connections
    pub host: String,
    /// Control port of the primary engine
    pub primary_port: u16,
    /// Port tried before launching the alternate engine
    pub alternate_port: u16,
    /// Delay between a successful launch and the next connection attempt
    pub retry_backoff: Duration,
    /// Upper bound on connection attempts (None = retry until cancelled)
    pub max_connect_retries: Option<u32>,
    /// Capability list announced before the start directive
    pub capabilities: String,
    /// Ports the alternate engine gateway may be told to listen on
    pub gateway_port_range: Range<u16>,
    /// Directory containing the `bgprocess/` folder with engine binaries
    pub install_dir: PathBuf,
    /// Launch the primary engine with debug logging enabled
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            primary_port: 62063,
            alternate_port: 62481,
            retry_backoff: Duration::from_secs(1),
            max_connect_retries: None, // Unbounded, matches deployed engines
            capabilities: "VIDEVENT_START".to_string(),
            gateway_port_range: 8000..58000,
            install_dir: PathBuf::from("."),
            debug: false,
        }
    }
}

/// Failover behaviour when the engine cannot serve a stream.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Resource opened to produce a failed stream before playback starts.
    /// Nothing is expected to listen here.
    pub dead_end_url: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            dead_end_url: "http://127.0.0.1:6877/createxpierror.html".to_string(),
        }
    }
}

/// HTTP client configuration for data and fallback retrieval.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Timeout for establishing HTTP connections
    pub connect_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Honour HTTP(S)_PROXY from the environment
    pub use_system_proxy: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: "tribe/0.1.0",
            use_system_proxy: true,
        }
    }
}

impl TribeConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Engine configuration overrides
        if let Ok(host) = std::env::var("TRIBE_ENGINE_HOST") {
            config.engine.host = host;
        }

        if let Ok(port) = std::env::var("TRIBE_ENGINE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.engine.primary_port = port;
            }
        }

        if let Ok(port) = std::env::var("TRIBE_ALTERNATE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.engine.alternate_port = port;
            }
        }

        if let Ok(backoff) = std::env::var("TRIBE_RETRY_BACKOFF_MS") {
            if let Ok(millis) = backoff.parse::<u64>() {
                config.engine.retry_backoff = Duration::from_millis(millis);
            }
        }

        if let Ok(retries) = std::env::var("TRIBE_MAX_CONNECT_RETRIES") {
            if let Ok(count) = retries.parse::<u32>() {
                config.engine.max_connect_retries = Some(count);
            }
        }

        if let Ok(dir) = std::env::var("TRIBE_ENGINE_DIR") {
            config.engine.install_dir = PathBuf::from(dir);
        }

        if let Ok(debug) = std::env::var("TRIBE_ENGINE_DEBUG") {
            config.engine.debug = debug.parse().unwrap_or(false);
        }

        // Failover configuration overrides
        if let Ok(url) = std::env::var("TRIBE_DEAD_END_URL") {
            if Url::parse(&url).is_ok() {
                config.failover.dead_end_url = url;
            }
        }

        // Network configuration overrides
        if let Ok(timeout) = std::env::var("TRIBE_CONNECT_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.connect_timeout = Duration::from_secs(seconds);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short backoff and connect timeout, and a bounded retry count so a
    /// broken test cannot spin forever.
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig {
                retry_backoff: Duration::from_millis(20),
                max_connect_retries: Some(20),
                ..Default::default()
            },
            network: NetworkConfig {
                connect_timeout: Duration::from_secs(2),
                use_system_proxy: false, // Simulated servers are all on loopback
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Checks settings that would otherwise only fail mid-session.
    ///
    /// # Errors
    /// - `TribeError::Configuration` - Empty gateway port range, empty
    ///   capability list or unparseable dead-end URL
    pub fn validate(&self) -> crate::Result<()> {
        if self.engine.gateway_port_range.is_empty() {
            return Err(TribeError::Configuration {
                reason: format!(
                    "gateway port range {:?} is empty",
                    self.engine.gateway_port_range
                ),
            });
        }

        if self.engine.capabilities.trim().is_empty() {
            return Err(TribeError::Configuration {
                reason: "capability list is empty".to_string(),
            });
        }

        Url::parse(&self.failover.dead_end_url).map_err(|e| TribeError::Configuration {
            reason: format!("dead-end URL {}: {e}", self.failover.dead_end_url),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TribeConfig::default();

        assert_eq!(config.engine.host, "127.0.0.1");
        assert_eq!(config.engine.primary_port, 62063);
        assert_eq!(config.engine.alternate_port, 62481);
        assert_eq!(config.engine.retry_backoff, Duration::from_secs(1));
        assert_eq!(config.engine.max_connect_retries, None);
        assert_eq!(config.engine.capabilities, "VIDEVENT_START");
        assert_eq!(config.engine.gateway_port_range, 8000..58000);
        assert!(!config.engine.debug);
        assert_eq!(
            config.failover.dead_end_url,
            "http://127.0.0.1:6877/createxpierror.html"
        );
        assert_eq!(config.network.user_agent, "tribe/0.1.0");
    }

    #[test]
    fn test_testing_preset_bounds_retries() {
        let config = TribeConfig::for_testing();

        assert_eq!(config.engine.retry_backoff, Duration::from_millis(20));
        assert_eq!(config.engine.max_connect_retries, Some(20));
        assert_eq!(config.engine.primary_port, 62063);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(TribeConfig::default().validate().is_ok());

        let mut config = TribeConfig::default();
        config.engine.gateway_port_range = 9000..9000;
        assert!(matches!(
            config.validate(),
            Err(TribeError::Configuration { .. })
        ));

        let mut config = TribeConfig::default();
        config.failover.dead_end_url = "not a url".to_string();
        let error = config.validate().unwrap_err();
        assert!(error.is_user_error());
    }
}
