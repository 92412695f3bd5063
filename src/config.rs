use crate::enums::{Processor, RenderMode};
use crate::renderer::CompositingParams;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid output size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// Settings of a rendering session. Missing fields take their defaults, so
/// `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub mode: RenderMode,
    /// Frames kept ahead of the current one. 0 disables the prefetch worker.
    pub prefetch_depth: usize,
    pub compositing: CompositingParams,
    pub processor: Processor,
    pub device_index: usize,
    /// Rotation of the view around the y axis, in radians.
    pub rotation_y: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            mode: RenderMode::default(),
            prefetch_depth: 2,
            compositing: CompositingParams::default(),
            processor: Processor::default(),
            device_index: 0,
            rotation_y: 0.0,
        }
    }
}

impl RenderConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("loaded render config from {}", path.display());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidSize {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = RenderConfig::from_json_str("{}").expect("valid");
        assert_eq!(config, RenderConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let config = RenderConfig::from_json_str(
            r#"{
                "width": 320,
                "mode": "Compositing",
                "processor": "CPU",
                "compositing": { "density": 0.4 }
            }"#,
        )
        .expect("valid");
        assert_eq!(config.width, 320);
        assert_eq!(config.height, 512);
        assert_eq!(config.mode, RenderMode::Compositing);
        assert_eq!(config.processor, Processor::CPU);
        assert_eq!(config.compositing.density, 0.4);
        assert_eq!(config.compositing.gamma, 1.0);
    }

    #[test]
    fn test_serialized_config_reads_back() {
        let config = RenderConfig {
            prefetch_depth: 5,
            rotation_y: 0.25,
            ..Default::default()
        };
        let json = config.to_json().expect("serializable");
        assert_eq!(RenderConfig::from_json_str(&json).expect("valid"), config);
    }

    #[test]
    fn test_rejects_invalid_input() {
        assert!(matches!(
            RenderConfig::from_json_str(r#"{"width": 0}"#),
            Err(ConfigError::InvalidSize { width: 0, .. })
        ));
        assert!(matches!(
            RenderConfig::from_json_str(r#"{"mode": "Sideways"}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            RenderConfig::from_json_file("/nonexistent/spim-render.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
