//! Endpoint configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TIDEWIRE_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tidewire_protocol::codec::{CodecConfig, DEFAULT_DECODER_CAPACITY, MIN_DECODER_CAPACITY};
use tidewire_protocol::compression::DEFAULT_COMPRESSION_THRESHOLD;
use tidewire_protocol::pool::{
    PoolConfig, DEFAULT_MAX_BUFFER_LEN, DEFAULT_MAX_IDLE, DEFAULT_MAX_RETAINED_LEN,
};
use tidewire_protocol::{CompressionMode, MAX_MESSAGE_SIZE};

/// Endpoint configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Framing and compression.
    pub codec: CodecSection,
    /// Chunk reassembly.
    pub reassembly: ReassemblySection,
    /// Request correlation.
    pub requests: RequestSection,
    /// Buffer pool limits.
    pub pool: PoolSection,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TIDEWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.codec.apply_env_overrides();
        self.reassembly.apply_env_overrides();
        self.requests.apply_env_overrides();
        self.pool.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Rejects values the endpoint cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.codec.validate()?;
        self.reassembly.validate()?;
        if self.requests.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "requests.timeout_ms must be positive".to_string(),
            ));
        }
        if self.pool.max_buffer_len < self.codec.max_message_size {
            return Err(ConfigError::ValidationError(format!(
                "pool.max_buffer_len ({}) is smaller than codec.max_message_size ({})",
                self.pool.max_buffer_len, self.codec.max_message_size
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Compression selection as written in config files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionSetting {
    None,
    #[default]
    Lz4,
}

impl CompressionSetting {
    pub fn mode(&self) -> CompressionMode {
        match self {
            CompressionSetting::None => CompressionMode::None,
            CompressionSetting::Lz4 => CompressionMode::Lz4,
        }
    }
}

/// Framing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecSection {
    /// Per-connection receive ring capacity in bytes.
    pub ring_capacity: usize,
    /// Compression applied to outbound payloads.
    pub compression: CompressionSetting,
    /// Payloads smaller than this are never compressed.
    pub compression_threshold: usize,
    /// Largest message accepted in either direction.
    pub max_message_size: usize,
}

impl Default for CodecSection {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_DECODER_CAPACITY,
            compression: CompressionSetting::Lz4,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl CodecSection {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("TIDEWIRE_RING_CAPACITY") {
            self.ring_capacity = n;
        }

        if let Some(n) = env_parse("TIDEWIRE_COMPRESSION_THRESHOLD") {
            self.compression_threshold = n;
        }

        if let Ok(mode) = std::env::var("TIDEWIRE_COMPRESSION") {
            self.compression = match mode.to_lowercase().as_str() {
                "none" | "off" | "0" => CompressionSetting::None,
                _ => CompressionSetting::Lz4,
            };
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity < MIN_DECODER_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "codec.ring_capacity must be at least {} bytes",
                MIN_DECODER_CAPACITY
            )));
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(ConfigError::ValidationError(
                "codec.max_message_size must be between 1 and 4294967295".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the encoder settings.
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig::default()
            .with_compression(self.compression.mode(), self.compression_threshold)
            .with_max_message_size(self.max_message_size)
    }
}

/// Chunk reassembly configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySection {
    /// Evict partial messages idle for this long (0 = never evict).
    pub idle_timeout_ms: u64,
    /// How often the background sweep runs.
    pub sweep_interval_ms: u64,
}

impl Default for ReassemblySection {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl ReassemblySection {
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse("TIDEWIRE_REASSEMBLY_IDLE_MS") {
            self.idle_timeout_ms = ms;
        }

        if let Some(ms) = env_parse("TIDEWIRE_SWEEP_INTERVAL_MS") {
            self.sweep_interval_ms = ms;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_ms > 0 && self.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reassembly.sweep_interval_ms must be positive when idle eviction is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the idle timeout, or `None` if eviction is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Request correlation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSection {
    /// Default time to wait for a response.
    pub timeout_ms: u64,
}

impl Default for RequestSection {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl RequestSection {
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse("TIDEWIRE_REQUEST_TIMEOUT_MS") {
            self.timeout_ms = ms;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Buffer pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Largest single buffer.
    pub max_buffer_len: usize,
    /// Larger buffers are freed on return instead of kept.
    pub max_retained_len: usize,
    /// Idle buffers kept for reuse.
    pub max_idle: usize,
    /// Buffers rented at once (0 = unlimited).
    pub max_outstanding: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
            max_retained_len: DEFAULT_MAX_RETAINED_LEN,
            max_idle: DEFAULT_MAX_IDLE,
            max_outstanding: 0,
        }
    }
}

impl PoolSection {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("TIDEWIRE_POOL_MAX_OUTSTANDING") {
            self.max_outstanding = n;
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_buffer_len: self.max_buffer_len,
            max_retained_len: self.max_retained_len,
            max_idle: self.max_idle,
            max_outstanding: self.max_outstanding,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.codec.ring_capacity, DEFAULT_DECODER_CAPACITY);
        assert_eq!(config.codec.compression, CompressionSetting::Lz4);
        assert_eq!(config.requests.timeout(), Duration::from_secs(10));
        assert_eq!(config.reassembly.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.pool.max_outstanding, 0); // unlimited by default
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "codec:\n  compression: none\n  compression_threshold: 64\nreassembly:\n  idle_timeout_ms: 0\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.codec.compression, CompressionSetting::None);
        assert_eq!(config.codec.compression_threshold, 64);
        assert_eq!(config.codec.ring_capacity, DEFAULT_DECODER_CAPACITY);
        assert_eq!(config.reassembly.idle_timeout(), None);
        assert_eq!(config.requests.timeout_ms, 10_000);

        let codec = config.codec.codec_config();
        assert_eq!(codec.compression, CompressionMode::None);
        assert_eq!(codec.compression_threshold, 64);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tidewire.yaml");

        let mut config = Config::default();
        config.pool.max_outstanding = 512;
        config.requests.timeout_ms = 250;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.pool.pool_config().max_outstanding, 512);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        assert!(matches!(
            Config::from_file("/nonexistent/tidewire.yaml"),
            Err(ConfigError::IoError(..))
        ));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "codec: [not, a, map]").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.codec.ring_capacity = 1024;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.requests.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reassembly.sweep_interval_ms = 0;
        assert!(config.validate().is_err());
        config.reassembly.idle_timeout_ms = 0;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.pool.max_buffer_len = 1024;
        assert!(config.validate().is_err());
    }
}
