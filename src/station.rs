//! Station descriptors
//!
//! A `StationTarget` is the read-only view of a polled station the engine
//! works from: how to reach it, which script talks to it, and the line
//! settings for serial links.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a station is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MediumType {
    /// Dial-up modem (medium id is the phone number)
    PolledModem,
    /// Direct TCP (medium id is `host[:port]`)
    #[default]
    PolledTcp,
    /// Station calls in (medium id is the identification token)
    Incoming,
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
            Parity::Mark => "mark",
            Parity::Space => "space",
        }
    }
}

/// Station descriptor, immutable for the duration of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationTarget {
    /// Platform / site name used in message headers
    pub name: String,
    #[serde(default)]
    pub medium_type: MediumType,
    pub medium_id: String,
    /// Selects the conversation script
    pub logger_type: String,
    #[serde(default)]
    pub baud: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub data_bits: u8,
    #[serde(default)]
    pub stop_bits: u8,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// `UTC`, `GMT`, `Z` or a fixed offset such as `-07:00`
    #[serde(default)]
    pub timezone: Option<String>,
    /// Site and platform properties available to scripts
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl StationTarget {
    /// Station with default line settings and no credentials
    pub fn new(
        name: impl Into<String>,
        medium_type: MediumType,
        medium_id: impl Into<String>,
        logger_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            medium_type,
            medium_id: medium_id.into(),
            logger_type: logger_type.into(),
            baud: 0,
            parity: Parity::None,
            data_bits: 0,
            stop_bits: 0,
            username: None,
            password: None,
            timezone: None,
            properties: HashMap::new(),
        }
    }

    /// Key used for the per-station status record
    pub fn status_key(&self) -> String {
        format!("{}:{}", self.name, self.medium_id)
    }

    /// Fixed offset of the station's configured time zone (UTC when unset or unknown)
    pub fn offset(&self) -> FixedOffset {
        self.timezone
            .as_deref()
            .and_then(parse_offset)
            .unwrap_or_else(utc_offset)
    }

    /// Convert a UTC time into the station's local offset
    pub fn local_time(&self, t: DateTime<Utc>) -> DateTime<FixedOffset> {
        t.with_timezone(&self.offset())
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Parse `UTC`, `GMT`, `Z`, `UTC+5`, `+05:00`, `-0700` into a fixed offset
pub fn parse_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    let upper = tz.to_ascii_uppercase();
    let rest = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    if rest.is_empty() || rest == "Z" {
        return Some(utc_offset());
    }

    let (sign, digits) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if digits.len() == 4 => (digits[..2].parse().ok()?, digits[2..].parse().ok()?),
        None => (digits.parse().ok()?, 0),
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
