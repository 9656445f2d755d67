//! DCP Poller - polling engine for remote field stations
//!
//! Stations (river and weather data loggers) are reached over outbound TCP,
//! dial-up modems on a device farm, local serial lines, or call in to a
//! listening socket. Each session runs the logger type's script and turns
//! the captured bytes into a `RetrievedMessage`.
//!
//! Layers, leaves first:
//! - `reader`: background stream reader with timed pattern matching
//! - `dialer`: TCP and modem connection setup on a port
//! - `port`: `IoPort` and the pool variants
//! - `protocol`: the script interpreter
//! - `session`: one station session
//! - `controller`: scheduling over a pool

pub mod cli;
pub mod config;
pub mod constants;
pub mod controller;
pub mod dialer;
pub mod error;
pub mod logging;
pub mod port;
pub mod protocol;
pub mod reader;
pub mod session;
pub mod shutdown;
pub mod sink;
pub mod station;
pub mod status;

pub use error::{PollError, Result};
