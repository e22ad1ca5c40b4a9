//! Server configuration
//!
//! Loaded from an optional TOML file; command-line flags override it.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 17986
//!
//! [display]
//! width = 640
//! height = 480
//! bits_per_pixel = 32
//! shm_mode = 0o666
//! ```

use crate::shm::DEFAULT_SHM_MODE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Well-known port: "FB".
pub const DEFAULT_PORT: u16 = 0x4642;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub display: DisplayConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Outbound events queued per session before broadcasts to it are dropped.
    pub event_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            event_queue: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    /// Permission bits of the shared segment.
    pub shm_mode: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            bits_per_pixel: 32,
            shm_mode: DEFAULT_SHM_MODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Milliseconds between blits of the shared buffer.
    pub refresh_ms: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self { refresh_ms: 500 }
    }
}

impl Config {
    /// Reads `path`, or returns defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!("configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}
