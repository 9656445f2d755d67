//! Dialers establish and tear down the transport on an `IoPort`
//!
//! - `TcpDialer`: outbound socket to `host[:port]`
//! - `ModemDialer`: Hayes AT dialing over an already-open serial line
//! - `NullDialer`: the port already carries a connection (inbound clients)

pub mod modem;
pub mod tcp;

pub use modem::ModemDialer;
pub use tcp::TcpDialer;

use crate::error::Result;
use crate::port::IoPort;
use crate::station::{MediumType, StationTarget};
use async_trait::async_trait;
use std::sync::Arc;

/// Connect / disconnect strategy for a port
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Short name for log output
    fn name(&self) -> &'static str;

    /// Establish the link to `target`; `PollError::Dial` after the dialer's own retries
    async fn connect(&self, port: &mut IoPort, target: &StationTarget) -> Result<()>;

    /// Tear the link down; idempotent and never fails
    async fn disconnect(&self, port: &mut IoPort);
}

/// Dialer for ports whose connection already exists
pub struct NullDialer;

#[async_trait]
impl Dialer for NullDialer {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn connect(&self, _port: &mut IoPort, _target: &StationTarget) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _port: &mut IoPort) {}
}

/// Dialer for a line-attached port (device farm or local serial)
///
/// Modem stations are dialed; anything else is wired straight through.
pub fn line_dialer(target: &StationTarget) -> Arc<dyn Dialer> {
    match target.medium_type {
        MediumType::PolledModem => Arc::new(ModemDialer::new()),
        MediumType::PolledTcp | MediumType::Incoming => Arc::new(NullDialer),
    }
}
