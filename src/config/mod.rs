//! Agent / server configuration, loaded from an optional TOML file.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};
use crate::screen::{DEFAULT_FPS, DEFAULT_QUALITY, MAX_CAPTURE_WIDTH, MAX_FPS, PREVIEW_WIDTH};
use crate::stream::throttle::{DEFAULT_MAX_CONCURRENT, DEFAULT_RATE_PER_SEC};
use crate::stream::{HubSettings, StreamConfig};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FramecastConfig {
    pub relay: RelayConfig,
    pub capture: CaptureConfig,
    pub throttle: ThrottleConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Upstream relay connection (agent mode) and relay bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay WebSocket URL the agent dials.
    pub url: String,
    /// Fixed delay between reconnect attempts, in seconds.
    pub reconnect_secs: u64,
    /// Bind address for `framecast relay`.
    pub listen: String,
}

/// Capture and encode defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Initial JPEG quality, 0-100.
    pub quality: u8,
    /// Initial frames per second, 1-60.
    pub fps: u32,
    pub max_width: u32,
    pub preview_width: u32,
    /// Frames buffered per subscriber before dropping (1-10).
    pub channel_capacity: usize,
    /// zstd level for the duplex mode.
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_concurrent: usize,
    pub rate_per_sec: u32,
}

/// Multipart HTTP mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
    pub display: usize,
    /// Basic auth is enabled when both are non-empty.
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000".into(),
            reconnect_secs: 5,
            listen: "127.0.0.1:3000".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            fps: DEFAULT_FPS,
            max_width: MAX_CAPTURE_WIDTH,
            preview_width: PREVIEW_WIDTH,
            channel_capacity: 2,
            compression_level: 1,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            rate_per_sec: DEFAULT_RATE_PER_SEC,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".into(),
            display: 0,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl FramecastConfig {
    /// Read and parse `path`. A missing file is `Ok(None)`.
    pub fn try_load(path: &Path) -> anyhow::Result<Option<Self>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        let cfg: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(Some(cfg))
    }

    /// Load from a TOML file, falling back to defaults. A file that exists
    /// but fails to parse or validate comes back as the error next to the
    /// defaults, so it can be reported once logging is up.
    pub fn load_or_default(path: &Path) -> (Self, Option<anyhow::Error>) {
        match Self::try_load(path) {
            Ok(Some(cfg)) => (cfg, None),
            Ok(None) => (Self::default(), None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.capture.quality > 100 {
            return Err(StreamError::Config(format!(
                "capture.quality {} outside 0-100",
                self.capture.quality
            )));
        }
        if !(1..=MAX_FPS).contains(&self.capture.fps) {
            return Err(StreamError::Config(format!(
                "capture.fps {} outside 1-{}",
                self.capture.fps, MAX_FPS
            )));
        }
        if self.capture.max_width == 0 || self.capture.preview_width == 0 {
            return Err(StreamError::Config("capture widths must be positive".into()));
        }
        Ok(())
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            max_width: self.capture.max_width,
            preview_width: self.capture.preview_width,
            channel_capacity: self.capture.channel_capacity,
            max_concurrent: self.throttle.max_concurrent,
            rate_per_sec: self.throttle.rate_per_sec,
            compression_level: self.capture.compression_level,
        }
    }

    /// Initial stream settings for a new connection or HTTP stream.
    pub fn stream_config(&self, compress: bool) -> StreamConfig {
        StreamConfig {
            quality: self.capture.quality,
            fps: self.capture.fps,
            compress,
            ..StreamConfig::default()
        }
    }

    pub fn auth(&self) -> Option<(String, String)> {
        if self.http.username.is_empty() || self.http.password.is_empty() {
            None
        } else {
            Some((self.http.username.clone(), self.http.password.clone()))
        }
    }
}
