//! Configuration
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, environment variables, command-line overrides.

mod schema;

pub use schema::*;

use std::path::Path;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::video::format::PixelFormat;

/// Environment variable holding the signaling URL
pub const ENV_WEBSOCKET_URL: &str = "WEBSOCKET_URL";
/// Environment variable holding the STUN URL
pub const ENV_STUN_URL: &str = "STUN_URL";
/// Misspelled STUN variable still honored when `STUN_URL` is unset
pub const ENV_STUN_URL_LEGACY: &str = "STURN_URL";

/// Values given on the command line; `None` keeps the lower layer
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub signaling_url: Option<String>,
    pub stun_url: Option<String>,
    pub device: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub format: Option<PixelFormat>,
}

/// Defaults, overlaid with the TOML file at `path` when given
pub fn load_file(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config: AppConfig = toml::from_str(&text)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Overlay environment variables, read through `lookup`
pub fn apply_env<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(ENV_WEBSOCKET_URL) {
        debug!("{} set", ENV_WEBSOCKET_URL);
        config.signaling.url = url;
    }
    let stun = lookup(ENV_STUN_URL).or_else(|| lookup(ENV_STUN_URL_LEGACY));
    if let Some(url) = stun {
        config.webrtc.set_stun_url(&url);
    }
}

/// Overlay command-line values
pub fn apply_overrides(config: &mut AppConfig, overrides: &ConfigOverrides) {
    if let Some(url) = &overrides.signaling_url {
        config.signaling.url = url.clone();
    }
    if let Some(url) = &overrides.stun_url {
        config.webrtc.set_stun_url(url);
    }
    if let Some(device) = &overrides.device {
        config.capture.device = device.clone();
    }
    if let Some(width) = overrides.width {
        config.capture.width = width;
    }
    if let Some(height) = overrides.height {
        config.capture.height = height;
    }
    if let Some(fps) = overrides.fps {
        config.capture.fps = fps;
    }
    if let Some(format) = overrides.format {
        config.capture.format = format;
    }
}

/// Build the effective configuration from every source and validate it
pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<AppConfig> {
    let mut config = load_file(path)?;
    apply_env(&mut config, |key| std::env::var(key).ok());
    apply_overrides(&mut config, overrides);
    config.validate()?;
    Ok(config)
}
