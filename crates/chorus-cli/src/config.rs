//! Configuration file support

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chorus_session::{DedupConfig, RetryConfig, TransportConfig};
use serde::{Deserialize, Serialize};

/// Configuration for chorus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Conversation endpoint
    pub url: Option<String>,
    /// Step-execution endpoint
    pub step_url: Option<String>,
    /// Seconds between websocket pings (0 disables the heartbeat)
    pub heartbeat_secs: u64,
    /// Seconds of silence before the socket is presumed dead
    pub heartbeat_timeout_secs: u64,
    /// Outbound frames kept while disconnected
    pub max_pending: usize,
    pub reconnect: ReconnectConfig,
    pub dedup: DedupSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            step_url: None,
            heartbeat_secs: 30,
            heartbeat_timeout_secs: 75,
            max_pending: chorus_session::transport::DEFAULT_MAX_PENDING,
            reconnect: ReconnectConfig::default(),
            dedup: DedupSettings::default(),
        }
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Give up after this many consecutive failures (unset retries forever)
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_retries: None,
        }
    }
}

/// Message deduplication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub enabled: bool,
    pub max_cache_size: usize,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_size: chorus_session::dedup::DEFAULT_MAX_CACHE_SIZE,
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chorus")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for CHORUS_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("CHORUS_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            url: Some("ws://localhost:8000/ws/chat".to_string()),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Build the transport configuration for an endpoint
    pub fn transport_config(&self, url: &str) -> TransportConfig {
        let heartbeat =
            (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs));
        let mut config = TransportConfig::new(url)
            .with_retry(RetryConfig {
                max_retries: self.reconnect.max_retries,
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                backoff_multiplier: self.reconnect.multiplier,
            })
            .with_heartbeat(heartbeat, Duration::from_secs(self.heartbeat_timeout_secs));
        config.max_pending = self.max_pending;
        config.auto_reconnect = self.reconnect.enabled;
        config
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            enabled: self.dedup.enabled,
            max_cache_size: self.dedup.max_cache_size,
            ..Default::default()
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# chorus configuration file
# Place at ~/.config/chorus/config.toml (Linux/Mac) or %APPDATA%\chorus\config.toml (Windows)

# Conversation endpoint
url = "ws://localhost:8000/ws/chat"

# Step-execution endpoint (optional)
# step_url = "ws://localhost:8000/ws/steps"

# Seconds between websocket pings (0 disables)
heartbeat_secs = 30

# Seconds without any traffic before the connection is considered dead
heartbeat_timeout_secs = 75

# Outbound frames kept while disconnected (oldest dropped first)
max_pending = 100

[reconnect]
enabled = true
initial_delay_ms = 1000
max_delay_ms = 30000
multiplier = 2.0
# max_retries = 10

[dedup]
enabled = true
max_cache_size = 1000
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.url.as_deref(), Some("ws://localhost:8000/ws/chat"));
        assert!(config.step_url.is_none());
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_retries, None);
        assert_eq!(config.dedup.max_cache_size, 1000);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("url = \"ws://x\"\n[dedup]\nenabled = false\n").unwrap();
        assert_eq!(config.heartbeat_secs, 30);
        assert_eq!(config.max_pending, 100);
        assert!(!config.dedup.enabled);
        assert_eq!(config.dedup.max_cache_size, 1000);
    }

    #[test]
    fn test_transport_config_mapping() {
        let mut config = Config::default();
        config.heartbeat_secs = 0;
        config.reconnect.enabled = false;
        config.reconnect.max_retries = Some(3);
        config.reconnect.initial_delay_ms = 250;

        let transport = config.transport_config("ws://backend");
        assert_eq!(transport.url, "ws://backend");
        assert!(transport.heartbeat_interval.is_none());
        assert!(!transport.auto_reconnect);
        assert_eq!(transport.retry.max_retries, Some(3));
        assert_eq!(transport.retry.initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/chorus/config.toml"));
        assert!(config.url.is_none());
        assert!(config.dedup_config().enabled);
    }
}
