//! Bridge configuration.
//!
//! All sections are optional in YAML; missing fields take their defaults.
//!
//! ```yaml
//! texture_pool:
//!   capacity: 4
//!   width: 1280
//!   height: 720
//!   format: bgra32
//! tables:
//!   output_streams: 32
//! streams:
//!   timeout_micros: 500000
//! log_filter: mpbridge=debug
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::texture::{self, MAX_TOTAL_FRAMES, TextureFormat};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub texture_pool: TexturePoolConfig,
    pub tables: TableConfig,
    pub streams: OutputStreamConfig,
    /// `EnvFilter` directive used by [`crate::logging::init_from_config`].
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            texture_pool: TexturePoolConfig::default(),
            tables: TableConfig::default(),
            streams: OutputStreamConfig::default(),
            log_filter: "mpbridge=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TexturePoolConfig {
    pub capacity: usize,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl Default for TexturePoolConfig {
    fn default() -> Self {
        Self { capacity: 10, width: 640, height: 480, format: TextureFormat::Rgba32 }
    }
}

/// Capacities of the process-wide lookup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    pub output_streams: usize,
    pub texture_frames: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self { output_streams: 20, texture_frames: MAX_TOTAL_FRAMES }
    }
}

/// Per-stream delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputStreamConfig {
    /// Also deliver empty packets that only advance the timestamp bound.
    pub observe_timestamp_bounds: bool,
    /// After this long without a packet, the stale-timestamp filter is reset.
    pub timeout_micros: i64,
}

impl Default for OutputStreamConfig {
    fn default() -> Self {
        Self { observe_timestamp_bounds: false, timeout_micros: 1_000_000 }
    }
}

impl BridgeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| BridgeError::file_error(path.to_path_buf(), e))?;
        debug!(path = %path.display(), "loading bridge config");
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let pool = &self.texture_pool;
        if pool.capacity == 0 || pool.capacity > MAX_TOTAL_FRAMES {
            return Err(BridgeError::config(format!(
                "texture_pool.capacity must be between 1 and {MAX_TOTAL_FRAMES}, got {}",
                pool.capacity
            )));
        }
        if pool.width == 0 || pool.height == 0 {
            return Err(BridgeError::config(format!(
                "texture_pool size {}x{} is empty",
                pool.width, pool.height
            )));
        }
        if self.tables.texture_frames < pool.capacity {
            return Err(BridgeError::config(format!(
                "tables.texture_frames ({}) is smaller than texture_pool.capacity ({})",
                self.tables.texture_frames, pool.capacity
            )));
        }
        if self.tables.output_streams == 0 {
            return Err(BridgeError::config("tables.output_streams must be at least 1"));
        }
        if self.streams.timeout_micros <= 0 {
            return Err(BridgeError::config("streams.timeout_micros must be positive"));
        }
        Ok(())
    }

    /// Resizes the process-wide tables.
    pub fn apply(&self) {
        texture::set_max_frames(self.tables.texture_frames);
        crate::stream::set_max_streams(self.tables.output_streams);
        debug!(
            texture_frames = self.tables.texture_frames,
            output_streams = self.tables.output_streams,
            "bridge tables resized"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BridgeConfig::default().validate().unwrap();
        assert_eq!(BridgeConfig::from_yaml_str("{}").unwrap(), BridgeConfig::default());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = BridgeConfig::from_yaml_str(
            "texture_pool:\n  capacity: 4\n  format: bgra32\nstreams:\n  observe_timestamp_bounds: true\n",
        )
        .unwrap();
        assert_eq!(config.texture_pool.capacity, 4);
        assert_eq!(config.texture_pool.format, TextureFormat::Bgra32);
        assert_eq!(config.texture_pool.width, 640);
        assert!(config.streams.observe_timestamp_bounds);
        assert_eq!(config.streams.timeout_micros, 1_000_000);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for yaml in [
            "texture_pool: { capacity: 0 }",
            "texture_pool: { capacity: 101 }",
            "texture_pool: { width: 0 }",
            "tables: { texture_frames: 2 }",
            "streams: { timeout_micros: 0 }",
        ] {
            assert!(matches!(BridgeConfig::from_yaml_str(yaml), Err(BridgeError::Config { .. })), "{yaml}");
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(BridgeConfig::from_yaml_str("texture_pool: { depth: 3 }").is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let mut config = BridgeConfig::default();
        config.texture_pool.format = TextureFormat::Alpha8;
        config.log_filter = "mpbridge=trace".into();
        let parsed = BridgeConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn missing_file_is_a_file_error() {
        let err = BridgeConfig::from_path("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, BridgeError::File { .. }));
    }
}
