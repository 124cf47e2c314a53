//! Service configuration
//!
//! Loads configuration from TOML at `~/.config/casement/config.toml`.
//! Auto-generates a default config file on first run if missing.

use anyhow::{Context, Result};
use casement_ipc::types::DisplayInfo;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub display: DisplayConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("config file not found at {:?}, using defaults", config_path);
            if let Err(err) = Self::save_default(&config_path) {
                warn!("failed to create default config file: {}", err);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).context("failed to read config file")?;
        let config: Config = toml::from_str(&content).context("failed to parse config file")?;
        info!("configuration loaded from {:?}", config_path);
        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("failed to get config directory")?
            .join("casement");
        Ok(config_dir.join("config.toml"))
    }

    fn save_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let toml_string =
            toml::to_string_pretty(&Self::default()).context("failed to serialize default config")?;
        fs::write(path, toml_string).context("failed to write default config file")?;
        info!("created default config file at {:?}", path);
        Ok(())
    }
}

/// Service-wide limits and policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Maximum simultaneous windows; further adds are rejected with a toast
    pub window_limit_max: usize,
    /// Carry shm object names in buffer ids so clients reopen by name
    pub buffer_queue_by_name: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { window_limit_max: 32, buffer_queue_by_name: false }
    }
}

/// How vsync ticks are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Periodic timer at the display refresh period
    Timer,
    /// Poll the framebuffer device fd, readable each refresh
    VsyncFd,
}

/// Primary display description
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: i32,
    pub height: i32,
    pub refresh_hz: u32,
    pub sync_mode: SyncMode,
    pub fbdev_device_path: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            refresh_hz: 60,
            sync_mode: SyncMode::Timer,
            fbdev_device_path: "/dev/fb0".into(),
        }
    }
}

impl DisplayConfig {
    pub fn display_info(&self) -> DisplayInfo {
        DisplayInfo {
            width: self.width,
            height: self.height,
            refresh_ns: 1_000_000_000u64 / self.refresh_hz.max(1) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_survives_toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.service.window_limit_max, 32);
        assert_eq!(back.display.sync_mode, SyncMode::Timer);
    }

    #[test]
    fn refresh_period_from_hz() {
        let display = DisplayConfig { refresh_hz: 60, ..Default::default() };
        assert_eq!(display.display_info().refresh_ns, 16_666_666);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config = toml::from_str("[service]\nwindow_limit_max = 1\n").unwrap();
        assert_eq!(config.service.window_limit_max, 1);
        assert_eq!(config.display.width, 1280);
    }
}
