//! Configuration for a single render run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compute::gpu::DeviceOptions;

fn default_width() -> u32 {
    128
}

fn default_height() -> u32 {
    128
}

fn default_entry_point() -> String {
    "main".to_string()
}

fn default_fill() -> [f32; 4] {
    [1.0; 4]
}

fn default_output() -> PathBuf {
    PathBuf::from("temp/output.png")
}

fn default_display_label() -> String {
    "Rendered Output".to_string()
}

/// Top-level render configuration, loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Output width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,
    /// Output height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,
    /// WGSL source file. `None` uses the bundled UV shader.
    #[serde(default)]
    pub shader: Option<PathBuf>,
    /// Compute entry point to dispatch.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Directories searched for the shader and its `#include`s.
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    /// Initial RGBA value of every output texel.
    #[serde(default = "default_fill")]
    pub fill: [f32; 4],
    /// PNG file written by the CLI.
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Apply the sRGB transfer curve when quantizing to 8 bits.
    #[serde(default)]
    pub srgb_gamma: bool,
    #[serde(default)]
    pub enable_debug_layers: bool,
    /// Capture `print_*` calls from `hostlog.wgsl`.
    #[serde(default)]
    pub enable_print: bool,
    /// Address of a running tev viewer, e.g. `127.0.0.1:14158`.
    #[serde(default)]
    pub tev: Option<String>,
    /// Image name shown in the viewer.
    #[serde(default = "default_display_label")]
    pub display_label: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            shader: None,
            entry_point: default_entry_point(),
            include_paths: Vec::new(),
            fill: default_fill(),
            output: default_output(),
            srgb_gamma: false,
            enable_debug_layers: false,
            enable_print: false,
            tev: None,
            display_label: default_display_label(),
        }
    }
}

impl RenderConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: RenderConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Device options implied by this configuration.
    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            enable_debug_layers: self.enable_debug_layers,
            enable_print: self.enable_print,
            include_paths: self.include_paths.clone(),
            ..Default::default()
        }
    }

    /// Number of texels in the output.
    #[inline]
    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.entry_point.trim().is_empty() {
            return Err(ConfigError::EmptyEntryPoint);
        }
        if self.fill.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::NonFiniteFill);
        }
        if self.output.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutput);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Output dimensions (width, height) must be non-zero")]
    InvalidDimensions,
    #[error("Entry point name must not be empty")]
    EmptyEntryPoint,
    #[error("Fill value must be finite")]
    NonFiniteFill,
    #[error("Output path must not be empty")]
    EmptyOutput,
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RenderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RenderConfig =
            serde_json::from_str(r#"{ "width": 32, "height": 16, "enable_print": true }"#).unwrap();
        assert_eq!(config.width, 32);
        assert_eq!(config.height, 16);
        assert_eq!(config.entry_point, "main");
        assert_eq!(config.fill, [1.0; 4]);
        assert_eq!(config.display_label, "Rendered Output");
        assert!(config.device_options().enable_print);
        assert_eq!(
            config.device_options().power_preference,
            wgpu::PowerPreference::HighPerformance
        );
        assert_eq!(config.texel_count(), 512);
    }

    #[test]
    fn test_rejects_invalid() {
        let config = RenderConfig {
            width: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDimensions)));

        let config = RenderConfig {
            entry_point: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyEntryPoint)));

        let config = RenderConfig {
            fill: [f32::NAN, 0.0, 0.0, 1.0],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NonFiniteFill)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.json");

        fs::write(
            &path,
            r#"{ "width": 4, "height": 2, "entry_point": "Identity", "display_label": "uv" }"#,
        )
        .unwrap();
        let config = RenderConfig::from_file(&path).unwrap();
        assert_eq!((config.width, config.height), (4, 2));
        assert_eq!(config.entry_point, "Identity");
        assert_eq!(config.display_label, "uv");

        fs::write(&path, r#"{ "width": 0 }"#).unwrap();
        assert!(matches!(RenderConfig::from_file(&path), Err(ConfigError::InvalidDimensions)));

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RenderConfig::from_file(&path), Err(ConfigError::Parse(_))));

        assert!(matches!(
            RenderConfig::from_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_roundtrip_json() {
        let config = RenderConfig {
            tev: Some("127.0.0.1:14158".into()),
            ..Default::default()
        };
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: RenderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
