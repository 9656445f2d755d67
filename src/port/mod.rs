//! Pooled station ports
//!
//! A `PortPool` owns a bounded set of ways to reach stations: outbound TCP
//! sockets, inbound client sockets, numbered ports on a device farm, or local
//! serial devices. A session leases one `IoPort` from the pool, connects it
//! to its station through the port's `Dialer`, and hands it back with
//! `release_port` when done.
//!
//! Exclusivity is carried by ownership: `allocate_port` returns an owned
//! `IoPort` and `release_port` consumes it, so a port cannot be held by two
//! sessions or released twice.
//!
//! # Adding a new pool
//!
//! 1. Create `port/my_pool.rs`
//! 2. Implement the `PortPool` trait
//! 3. Add a `PoolConfig` variant and a branch in `build_pool`

pub mod configurator;
pub mod farm;
pub mod listen;
pub mod serial;
pub mod tcp;

pub use farm::DeviceFarmPool;
pub use listen::ListeningPool;
pub use serial::SerialPool;
pub use tcp::TcpClientPool;

use crate::config::{PollerSettings, PoolConfig};
use crate::dialer::{Dialer, NullDialer};
use crate::error::{PollError, Result};
use crate::logging::SessionLog;
use crate::station::StationTarget;
use crate::status::StatusStore;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Read half of a connected port
pub type PortInput = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connected port
pub type PortOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a station session (and of asynchronous device configuration)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Waiting,
    Running,
    Success,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// IoPort
// =============================================================================

/// A leased port: identity within its pool, dialer, and stream halves once connected
pub struct IoPort {
    port_num: u32,
    port_name: String,
    dialer: Arc<dyn Dialer>,
    input: Option<PortInput>,
    output: Option<PortOutput>,
    peer: Option<SocketAddr>,
    configure_state: SessionState,
    log: Option<SessionLog>,
}

impl fmt::Debug for IoPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPort")
            .field("port_num", &self.port_num)
            .field("port_name", &self.port_name)
            .field("dialer", &self.dialer.name())
            .field("connected", &self.output.is_some())
            .field("peer", &self.peer)
            .finish()
    }
}

impl IoPort {
    pub fn new(port_num: u32, port_name: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            port_num,
            port_name: port_name.into(),
            dialer,
            input: None,
            output: None,
            peer: None,
            configure_state: SessionState::Waiting,
            log: None,
        }
    }

    /// Port already carrying an accepted connection
    pub fn from_stream<S>(port_num: u32, port_name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut port = Self::new(port_num, port_name, Arc::new(NullDialer));
        port.attach(stream);
        port
    }

    pub fn port_num(&self) -> u32 {
        self.port_num
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    pub fn set_dialer(&mut self, dialer: Arc<dyn Dialer>) {
        self.dialer = dialer;
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: Option<SocketAddr>) {
        self.peer = peer;
    }

    pub fn configure_state(&self) -> SessionState {
        self.configure_state
    }

    pub fn set_configure_state(&mut self, state: SessionState) {
        self.configure_state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.output.is_some()
    }

    /// Split a bidirectional stream onto this port
    pub fn attach<S>(&mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        self.input = Some(Box::new(rd));
        self.output = Some(Box::new(wr));
    }

    /// Lend the input half to a reader
    pub fn take_input(&mut self) -> Option<PortInput> {
        self.input.take()
    }

    pub fn restore_input(&mut self, input: PortInput) {
        self.input = Some(input);
    }

    /// Mirror transmitted bytes into a session file
    pub fn set_session_log(&mut self, log: Option<SessionLog>) {
        self.log = log;
    }

    pub fn session_log(&self) -> Option<&SessionLog> {
        self.log.as_ref()
    }

    /// Write and flush; fails with `NotConnected` when no output is attached
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        let out = self
            .output
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        out.write_all(data).await?;
        out.flush().await?;
        if let Some(ref log) = self.log {
            log.sent(data);
        }
        Ok(())
    }

    /// Prepare the device through the pool, then run the dialer
    pub async fn connect(&mut self, pool: &dyn PortPool, target: &StationTarget) -> Result<()> {
        pool.config_port(self, target).await?;
        let dialer = self.dialer.clone();
        dialer.connect(self, target).await
    }

    /// Hang up and drop the streams; never fails, safe to repeat
    pub async fn disconnect(&mut self) {
        let dialer = self.dialer.clone();
        dialer.disconnect(self).await;
        self.close_streams().await;
    }

    /// Shut down the write half and drop both halves
    pub async fn close_streams(&mut self) {
        if let Some(mut out) = self.output.take() {
            let _ = out.shutdown().await;
        }
        self.input = None;
        self.log = None;
    }
}

// =============================================================================
// PortPool
// =============================================================================

/// Bounded set of ports shared by concurrent sessions
///
/// Allocation and release on one pool are serialized by the pool's lock.
#[async_trait]
pub trait PortPool: Send + Sync {
    /// Pool kind, for log output
    fn name(&self) -> &str;

    /// Lease a free port, or `None` when none is available right now
    async fn allocate_port(&self) -> Option<IoPort>;

    /// Return a port; safe for ports that never connected
    async fn release_port(&self, port: IoPort, final_state: SessionState, was_connect_error: bool);

    fn num_ports(&self) -> usize;

    fn num_free_ports(&self) -> usize;

    /// Device preparation run by `IoPort::connect` before the dialer
    async fn config_port(&self, _port: &mut IoPort, _target: &StationTarget) -> Result<()> {
        Ok(())
    }

    /// Release everything still held; never hangs
    async fn close(&self);
}

/// Build an outbound pool from the `[pool]` section
///
/// The listening pool is bound separately (`ListeningPool::bind`) because its
/// controller needs the concrete type.
pub async fn build_pool(
    pool: &PoolConfig,
    settings: &PollerSettings,
    store: Arc<dyn StatusStore>,
) -> Result<Arc<dyn PortPool>> {
    match pool {
        PoolConfig::TcpClient(s) => Ok(Arc::new(TcpClientPool::from_config(s)?)),
        PoolConfig::DeviceFarm(s) => Ok(Arc::new(DeviceFarmPool::from_config(
            s,
            store,
            &settings.process_name,
        )?)),
        PoolConfig::Serial(s) => Ok(Arc::new(SerialPool::from_config(s)?)),
        PoolConfig::Listening(_) => Err(PollError::config(
            "listening pool accepts stations; use the listen command",
        )),
    }
}

/// Parse a port list such as `1-4,7,9-10`
///
/// Returns the sorted, de-duplicated port numbers. Empty lists and
/// reversed ranges are configuration errors.
pub fn parse_port_list(spec: &str) -> Result<Vec<u32>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let bad = || PollError::config(format!("invalid port range '{}'", part));
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| bad())?;
                let hi: u32 = hi.trim().parse().map_err(|_| bad())?;
                if lo > hi {
                    return Err(bad());
                }
                ports.extend(lo..=hi);
            }
            None => ports.push(part.parse().map_err(|_| bad())?),
        }
    }
    ports.sort_unstable();
    ports.dedup();
    if ports.is_empty() {
        return Err(PollError::config("no ports configured"));
    }
    Ok(ports)
}
