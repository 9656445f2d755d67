//! Logger protocols
//!
//! A `LoggerProtocol` runs the conversation with one station once its port
//! is connected: `login`, `get_data(since)`, `goodbye`. The shipped protocol
//! is the script interpreter (`PollScriptProtocol`); the logger type of each
//! station selects its script through the logger-type table.

pub mod expand;
pub mod interp;
pub mod script;

pub use interp::PollScriptProtocol;

use crate::config::{Config, LoggerTypeEntry};
use crate::error::{PollError, Result};
use crate::port::IoPort;
use crate::station::StationTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Failure code of a good retrieved message
pub const FAILURE_CODE_GOOD: char = 'G';

/// Bytes retrieved from a station, with a text header prepended
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedMessage {
    /// Header followed by the captured bytes
    pub data: Vec<u8>,
    pub header_length: usize,
    pub station: String,
    pub medium_id: String,
    pub carrier_start: DateTime<Utc>,
    pub carrier_stop: DateTime<Utc>,
    pub receive_time: DateTime<Utc>,
    pub failure_code: char,
}

impl RetrievedMessage {
    /// Build the message for a finished session
    ///
    /// Header lines use UTC `yyMMdd HHmmss +0000`:
    /// `//STATION`, `//SOURCE`, `//DEVICE END TIME`, `//POLL START`, `//POLL STOP`.
    pub fn assemble(
        target: &StationTarget,
        session_start: DateTime<Utc>,
        session_end: DateTime<Utc>,
        captured: &[u8],
    ) -> Self {
        const HEADER_TIME: &str = "%y%m%d %H%M%S %z";
        let start = session_start.format(HEADER_TIME);
        let header = format!(
            "//STATION {}\n//SOURCE {}\n//DEVICE END TIME {}\n//POLL START {}\n//POLL STOP {}\n",
            target.name,
            target.logger_type,
            start,
            start,
            session_end.format(HEADER_TIME)
        );
        let mut data = Vec::with_capacity(header.len() + captured.len());
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(captured);

        Self {
            data,
            header_length: header.len(),
            station: target.name.clone(),
            medium_id: target.medium_id.clone(),
            carrier_start: session_start,
            carrier_stop: session_end,
            receive_time: session_end,
            failure_code: FAILURE_CODE_GOOD,
        }
    }

    pub fn header(&self) -> &[u8] {
        &self.data[..self.header_length]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_length..]
    }
}

/// Conversation with one station over a connected port
#[async_trait]
pub trait LoggerProtocol: Send {
    /// Prepare the conversation (for scripts: load and parse the script)
    async fn login(&mut self, port: &mut IoPort, target: &StationTarget) -> Result<()>;

    /// Retrieve data recorded since `since`
    async fn get_data(
        &mut self,
        port: &mut IoPort,
        target: &StationTarget,
        since: DateTime<Utc>,
    ) -> Result<RetrievedMessage>;

    /// Sign off
    async fn goodbye(&mut self, port: &mut IoPort, target: &StationTarget) -> Result<()>;

    /// Stop any background reading and hand the input back to the port
    async fn close(&mut self, port: &mut IoPort);
}

/// Logger-type table: builds the protocol for a station's logger type
#[derive(Debug, Clone)]
pub struct ProtocolFactory {
    script_dir: PathBuf,
    logger_types: HashMap<String, LoggerTypeEntry>,
}

impl ProtocolFactory {
    pub fn new(script_dir: impl Into<PathBuf>, logger_types: HashMap<String, LoggerTypeEntry>) -> Self {
        Self {
            script_dir: script_dir.into(),
            logger_types,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.poller.script_dir.clone(), config.logger_types.clone())
    }

    /// Script file for a logger type (case-insensitive lookup)
    pub fn script_path(&self, logger_type: &str) -> Result<PathBuf> {
        let entry = self.entry(logger_type)?;
        Ok(self.script_dir.join(&entry.script))
    }

    fn entry(&self, logger_type: &str) -> Result<&LoggerTypeEntry> {
        let wanted = logger_type.trim();
        if wanted.is_empty() {
            return Err(PollError::config("station has no logger type"));
        }
        self.logger_types
            .get(wanted)
            .or_else(|| {
                self.logger_types
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(wanted))
                    .map(|(_, v)| v)
            })
            .ok_or_else(|| PollError::config(format!("unknown logger type '{}'", wanted)))
    }

    /// Protocol for `logger_type`; unknown types are a `Config` error
    pub fn make(&self, logger_type: &str, shutdown: Arc<AtomicBool>) -> Result<Box<dyn LoggerProtocol>> {
        let entry = self.entry(logger_type)?;
        Ok(Box::new(PollScriptProtocol::new(
            self.script_dir.join(&entry.script),
            entry.lines_per_hour,
            shutdown,
        )))
    }
}
