//! Configuration management for planfix

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Floor-plan image extent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Plan image; when set, its header overrides `width`/`height`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            width: 1000,
            height: 1000,
        }
    }
}

impl PlanConfig {
    /// Pixel extent of the plan, read from the image when one is configured
    pub fn extent(&self) -> Result<(u32, u32)> {
        match &self.image_path {
            Some(path) => {
                let (w, h) = image::image_dimensions(path)
                    .with_context(|| format!("Failed to read plan image {:?}", path))?;
                tracing::info!("Plan image {:?} is {}x{}", path, w, h);
                Ok((w, h))
            }
            None => Ok((self.width, self.height)),
        }
    }
}

/// GPS capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Length of the stabilization window
    pub duration_ms: u64,
    /// Pause between location reads
    pub poll_interval_ms: u64,
    /// Pushed readings older than this count as unavailable
    pub max_reading_age_ms: u64,
    /// Attach the 999 m placeholder when every read in the window failed,
    /// instead of rejecting the capture
    pub accept_unavailable: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            poll_interval_ms: 1_000,
            max_reading_age_ms: 5_000,
            accept_unavailable: false,
        }
    }
}

impl CaptureConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_reading_age(&self) -> Duration {
        Duration::from_millis(self.max_reading_age_ms)
    }
}

/// Calibration record storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Where solved records are persisted and loaded from at startup
    pub path: PathBuf,
    /// Pre-supplied record used when `path` holds no valid record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundled: Option<PathBuf>,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("calibration.json"),
            bundled: None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub plan: PlanConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub record: RecordConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
