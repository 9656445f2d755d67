//! Configuration management
//!
//! A single TOML file describes one polling run:
//! - `[poller]` scheduling and output settings
//! - `[pool]` which port pool to use and its settings
//! - `[logger_types.<name>]` script file per logger type
//! - `[[stations]]` the stations to poll (or accept, for a listening pool)

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_FARM_PORT_BASE, DEFAULT_LISTENING_PORT,
    DEFAULT_MAX_BACKLOG_HOURS, DEFAULT_MIN_BACKLOG_HOURS, DEFAULT_POLL_NUM_TRIES,
};
use crate::error::{PollError, Result};
use crate::station::StationTarget;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

// =============================================================================
// Run Configuration
// =============================================================================

/// Complete configuration for one poller process
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub poller: PollerSettings,
    pub pool: PoolConfig,
    pub logger_types: HashMap<String, LoggerTypeEntry>,
    pub stations: Vec<StationTarget>,
}

/// Per-run settings passed explicitly to controllers and sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    /// Attempts per station before it is tallied as failed
    pub poll_num_tries: u32,
    /// Never ask for more history than this
    pub max_backlog_hours: u32,
    /// Always ask for at least this much history
    pub min_backlog_hours: u32,
    /// Directory holding the logger-type scripts
    pub script_dir: PathBuf,
    /// Session file name template (`$MEDIUMID`, `$STATION`, `$DATE(fmt)`)
    pub save_session_file: Option<String>,
    /// JSON file backing the status store (in-memory when unset)
    pub status_file: Option<PathBuf>,
    /// Identity recorded on device-farm port records
    pub process_name: String,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_num_tries: DEFAULT_POLL_NUM_TRIES,
            max_backlog_hours: DEFAULT_MAX_BACKLOG_HOURS,
            min_backlog_hours: DEFAULT_MIN_BACKLOG_HOURS,
            script_dir: PathBuf::from("scripts"),
            save_session_file: None,
            status_file: None,
            process_name: "dcp-poll".to_string(),
        }
    }
}

/// Script selection for one logger type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerTypeEntry {
    /// Script file, relative to `script_dir` unless absolute
    pub script: PathBuf,
    /// Lines the logger stores per hour; enables the `LINES` variable
    #[serde(default)]
    pub lines_per_hour: Option<u32>,
}

// =============================================================================
// Pool Configuration
// =============================================================================

/// Port pool selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PoolConfig {
    /// Outbound TCP straight to each station
    TcpClient(TcpPoolSettings),
    /// Stations call in on a listening socket
    Listening(ListeningPoolSettings),
    /// Terminal server with modems or serial lines on numbered ports
    DeviceFarm(FarmPoolSettings),
    /// Local serial devices (modems or direct wires)
    Serial(SerialPoolSettings),
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::TcpClient(TcpPoolSettings::default())
    }
}

impl PoolConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TcpClient(_) => "tcp-client",
            Self::Listening(_) => "listening",
            Self::DeviceFarm(_) => "device-farm",
            Self::Serial(_) => "serial",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpPoolSettings {
    /// Concurrent outbound sessions
    pub max_sockets: usize,
    pub connect_timeout_secs: u64,
}

impl Default for TcpPoolSettings {
    fn default() -> Self {
        Self {
            max_sockets: 10,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListeningPoolSettings {
    pub listening_port: u16,
    /// Concurrent client sessions
    pub max_sockets: usize,
    /// `none` or `password=<prompt>=<value>`
    pub authenticate_client: String,
}

impl Default for ListeningPoolSettings {
    fn default() -> Self {
        Self {
            listening_port: DEFAULT_LISTENING_PORT,
            max_sockets: 10,
            authenticate_client: "none".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmPoolSettings {
    /// Terminal server host name or address (required)
    pub host: String,
    /// Port numbers, e.g. `1-8,12`
    pub ports: String,
    /// TCP port of farm port `n` is `port_base + n`
    pub port_base: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Command prompt of the terminal server's control shell
    pub prompt: String,
    pub connect_timeout_secs: u64,
    /// Skip the remote serial-settings step
    pub skip_configure: bool,
}

impl Default for FarmPoolSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            ports: String::new(),
            port_base: DEFAULT_FARM_PORT_BASE,
            username: None,
            password: None,
            prompt: "#>".to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            skip_configure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SerialPoolSettings {
    /// Device paths (`/dev/ttyUSB0`, `COM3`, ...)
    pub devices: Vec<String>,
}

// =============================================================================
// Loading
// =============================================================================

/// Read, parse and validate a config file
pub fn load(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|e| PollError::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config = parse(&content).map_err(|e| match e {
        ParseFailure::Toml(source) => PollError::ConfigParse {
            path: path.to_path_buf(),
            source,
        },
        ParseFailure::Invalid(err) => err,
    })?;

    // Relative script directories are resolved against the config file
    let mut config = config;
    if config.poller.script_dir.is_relative() {
        if let Some(parent) = path.parent() {
            config.poller.script_dir = parent.join(&config.poller.script_dir);
        }
    }
    Ok(config)
}

enum ParseFailure {
    Toml(toml::de::Error),
    Invalid(PollError),
}

fn parse(content: &str) -> std::result::Result<Config, ParseFailure> {
    let config: Config = toml::from_str(content).map_err(ParseFailure::Toml)?;
    config.validate().map_err(ParseFailure::Invalid)?;
    Ok(config)
}

impl Config {
    /// Check settings that would otherwise fail every session the same way
    pub fn validate(&self) -> Result<()> {
        let p = &self.poller;
        if p.poll_num_tries == 0 {
            return Err(PollError::config("poll_num_tries must be at least 1"));
        }
        if p.min_backlog_hours > p.max_backlog_hours {
            return Err(PollError::config(format!(
                "min_backlog_hours ({}) exceeds max_backlog_hours ({})",
                p.min_backlog_hours, p.max_backlog_hours
            )));
        }

        let mut seen = HashSet::new();
        for station in &self.stations {
            if station.medium_id.trim().is_empty() {
                return Err(PollError::config(format!(
                    "station '{}' has no medium_id",
                    station.name
                )));
            }
            if !seen.insert(station.medium_id.as_str()) {
                return Err(PollError::config(format!(
                    "duplicate medium_id '{}'",
                    station.medium_id
                )));
            }
            if !self.logger_types.contains_key(&station.logger_type) {
                // Surfaces later as a per-station Config failure
                warn!(
                    station = %station.name,
                    "unknown logger type '{}'", station.logger_type
                );
            }
        }
        Ok(())
    }
}
