//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for a readout board.
//! Configuration is loaded from:
//! 1. `config/reb.toml` (base configuration)
//! 2. Environment variables (prefixed with `REB_`, sections split on `__`)
//!
//! Every field has a default, so a board can be brought up with no file at all.
//!
//! # Example
//! ```no_run
//! use reb_gige::config::RebConfig;
//!
//! let config = RebConfig::load()?;
//! config.validate()?;
//! println!("Board {} on {}", config.device.reb_id, config.device.iface);
//! # Ok::<(), reb_gige::error::RebError>(())
//! ```

use crate::error::{AppResult, RebError};
use crate::logging::OutputFormat;
use crate::storage::writer::check_extra_keyword;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default location of the board configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/reb.toml";

/// Top-level board configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Board identity and readout shape
    pub device: DeviceConfig,
    /// Publish/subscribe broadcast settings
    pub broadcast: BroadcastConfig,
    /// FITS output settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: OutputFormat,
    /// Log span open and close events
    pub log_spans: bool,
    /// Include source file and line in every event
    pub log_source: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "REB GigE readout".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
            log_spans: false,
            log_source: false,
        }
    }
}

/// Board identity and readout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Board id; offsets the broadcast port and names output files
    pub reb_id: u32,
    /// Register server address
    pub ip_addr: String,
    /// Network interface the pixel stream arrives on
    pub iface: String,
    /// ADC channels (amplifiers) per stripe
    pub channels: u32,
    /// Start the broadcast publisher with the device
    pub image_service: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            reb_id: 0,
            ip_addr: "tcp://localhost".to_string(),
            iface: "eth0".to_string(),
            channels: crate::stripe::CHANNELS,
            image_service: true,
        }
    }
}

/// Broadcast publisher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// TCP port of board 0; board N binds `base_port + N`
    pub base_port: u16,
    /// Host part of the TCP bind endpoint
    pub bind_host: String,
    /// IPC socket path; `{id}` is replaced by the board id
    pub ipc_path_template: String,
    /// Samples per data message
    pub chunk_samples: usize,
    /// Upper bound on one readiness or rendezvous wait before the stop signal is
    /// rechecked
    pub wait_timeout_ms: u64,
    /// Optional subscriber handshake before each cycle
    pub rendezvous: RendezvousConfig,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            base_port: 5550,
            bind_host: "*".to_string(),
            ipc_path_template: "/tmp/reb_{id}.ipc".to_string(),
            chunk_samples: crate::broadcast::protocol::CHUNK_SAMPLES,
            wait_timeout_ms: 100,
            rendezvous: RendezvousConfig::default(),
        }
    }
}

impl BroadcastConfig {
    /// TCP endpoint the publisher binds for board `reb_id`.
    pub fn tcp_endpoint(&self, reb_id: u32) -> String {
        format!(
            "tcp://{}:{}",
            self.bind_host,
            u32::from(self.base_port) + reb_id
        )
    }

    /// IPC endpoint the publisher binds for board `reb_id`.
    pub fn ipc_endpoint(&self, reb_id: u32) -> String {
        format!(
            "ipc://{}",
            self.ipc_path_template.replace("{id}", &reb_id.to_string())
        )
    }
}

/// Subscriber rendezvous handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Wait for subscribers before every broadcast cycle
    pub enabled: bool,
    /// REP endpoint subscribers send their sync request to
    pub endpoint: String,
    /// Number of sync requests collected before a cycle may run
    pub subscribers_expected: u32,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "tcp://*:5562".to_string(),
            subscribers_expected: 1,
        }
    }
}

/// FITS output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// File extension appended after the device/stripe suffix
    pub format_extension: String,
    /// Extra primary-header keywords written into every file
    pub header_keywords: BTreeMap<String, String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            format_extension: "fits".to_string(),
            header_keywords: BTreeMap::new(),
        }
    }
}

impl RebConfig {
    /// Load configuration from `config/reb.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `REB_`.
    /// Example: `REB_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path).extract().map_err(RebError::from)
    }

    /// Layered provider: defaults, then file, then environment.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(RebConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("REB_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(RebError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        // Geometry metadata mirrors the two amplifier rows, so the count must split evenly
        if self.device.channels == 0 || self.device.channels % 2 != 0 {
            return Err(RebError::Configuration(format!(
                "Invalid channel count {}. Must be a positive even number",
                self.device.channels
            )));
        }

        if self.broadcast.chunk_samples == 0 {
            return Err(RebError::Configuration(
                "broadcast.chunk_samples must be greater than 0".to_string(),
            ));
        }

        if u32::from(self.broadcast.base_port) + self.device.reb_id > u32::from(u16::MAX) {
            return Err(RebError::Configuration(format!(
                "Broadcast port {} + board id {} exceeds 65535",
                self.broadcast.base_port, self.device.reb_id
            )));
        }

        if self.broadcast.rendezvous.enabled && self.broadcast.rendezvous.subscribers_expected == 0
        {
            return Err(RebError::Configuration(
                "rendezvous.subscribers_expected must be at least 1 when enabled".to_string(),
            ));
        }

        let ext = self.storage.format_extension.trim_start_matches('.');
        if ext.is_empty() {
            return Err(RebError::Configuration(
                "storage.format_extension must not be empty".to_string(),
            ));
        }

        for (key, value) in &self.storage.header_keywords {
            let valid = !key.is_empty()
                && key.len() <= 8
                && key
                    .bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
            if !valid {
                return Err(RebError::Configuration(format!(
                    "Header keyword '{}' must be 1-8 characters of A-Z, 0-9, '-' or '_'",
                    key
                )));
            }
            check_extra_keyword(key, value).map_err(|e| {
                RebError::Configuration(format!("storage.header_keywords.{}: {}", key, e))
            })?;
        }

        Ok(())
    }
}
