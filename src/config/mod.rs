//! Configuration: CLI arguments and session config file support

mod args;

pub use args::{Args, Command};

use crate::sync::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Session configuration loaded from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ring buffer span in seconds
    pub buffer_seconds: u32,

    /// Maximum number of concurrent audio streams
    pub max_audio_streams: usize,

    /// Output channel count (1 or 2)
    pub target_channels: u16,

    /// Output bit depth (8, 16 or 32)
    pub target_bits: u16,

    /// Memory ceiling for the video buffer in megabytes
    pub video_memory_mb: usize,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = no file logging)
    #[serde(default)]
    pub log_file: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 10,
            max_audio_streams: 8,
            target_channels: 2,
            target_bits: 16,
            video_memory_mb: 256,
            log_level: "info".to_string(),
            log_file: String::new(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: avmux.toml
    /// 2. Working directory: avmux.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let config_path = exe_dir.join("avmux.toml");
                if config_path.exists() {
                    return Self::load(&config_path);
                }
            }
        }

        let config_path = Path::new("avmux.toml");
        if config_path.exists() {
            return Self::load(config_path);
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Convert to EngineConfig
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer_seconds: self.buffer_seconds,
            max_audio_streams: self.max_audio_streams,
            target_channels: self.target_channels,
            target_bits: self.target_bits,
            video_memory_ceiling: self.video_memory_mb * 1024 * 1024,
        }
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# avmux Session Configuration
# This file configures the avmux synchronization engine

# Ring buffer span in seconds (default: 10)
buffer_seconds = 10

# Maximum number of concurrent audio streams (default: 8)
max_audio_streams = 8

# Output channel count: 1 or 2 (default: 2)
target_channels = 2

# Output bit depth: 8, 16 or 32 (default: 16)
target_bits = 16

# Memory ceiling for the video buffer in megabytes (default: 256)
video_memory_mb = 256

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Log file path (empty = no file logging)
# Example: log_file = "/var/log/avmux.log"
log_file = ""
"#
        .to_string()
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file
    Io {
        path: String,
        source: std::io::Error,
    },
    /// Error parsing TOML
    Parse {
        path: String,
        source: toml::de::Error,
    },
    /// Error serializing config
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config file '{}': {}", path, source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config file '{}': {}", path, source)
            }
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses_to_defaults() {
        let parsed: SessionConfig = toml::from_str(&SessionConfig::sample_config()).unwrap();
        let defaults = SessionConfig::default();
        assert_eq!(parsed.buffer_seconds, defaults.buffer_seconds);
        assert_eq!(parsed.max_audio_streams, defaults.max_audio_streams);
        assert_eq!(parsed.target_channels, defaults.target_channels);
        assert_eq!(parsed.target_bits, defaults.target_bits);
        assert_eq!(parsed.video_memory_mb, defaults.video_memory_mb);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let parsed: SessionConfig = toml::from_str("target_channels = 1\n").unwrap();
        assert_eq!(parsed.target_channels, 1);
        assert_eq!(parsed.buffer_seconds, 10);
    }

    #[test]
    fn test_engine_config_conversion() {
        let config = SessionConfig {
            video_memory_mb: 64,
            ..Default::default()
        };
        let engine = config.to_engine_config();
        assert_eq!(engine.video_memory_ceiling, 64 * 1024 * 1024);
        assert_eq!(engine.buffer_seconds, 10);
    }
}
