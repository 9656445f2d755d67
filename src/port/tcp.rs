//! Outbound TCP pool
//!
//! Ports are just slots: the pool counts outstanding leases against
//! `max_sockets` and each lease dials its station directly.

use super::{IoPort, PortPool, SessionState};
use crate::config::TcpPoolSettings;
use crate::dialer::{Dialer, TcpDialer};
use crate::error::{PollError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct TcpClientPool {
    max_sockets: usize,
    dialer: Arc<dyn Dialer>,
    allocated: Mutex<BTreeSet<u32>>,
}

impl TcpClientPool {
    pub fn from_config(settings: &TcpPoolSettings) -> Result<Self> {
        if settings.max_sockets == 0 {
            return Err(PollError::config("tcp-client pool needs max_sockets > 0"));
        }
        Ok(Self::new(
            settings.max_sockets,
            Duration::from_secs(settings.connect_timeout_secs),
        ))
    }

    pub fn new(max_sockets: usize, connect_timeout: Duration) -> Self {
        Self {
            max_sockets,
            dialer: Arc::new(TcpDialer::new(connect_timeout)),
            allocated: Mutex::new(BTreeSet::new()),
        }
    }
}

#[async_trait]
impl PortPool for TcpClientPool {
    fn name(&self) -> &str {
        "tcp-client"
    }

    async fn allocate_port(&self) -> Option<IoPort> {
        let mut allocated = self.allocated.lock();
        if allocated.len() >= self.max_sockets {
            return None;
        }
        let num = (0..self.max_sockets as u32).find(|n| !allocated.contains(n))?;
        allocated.insert(num);
        debug!("allocated tcp-{} ({}/{})", num, allocated.len(), self.max_sockets);
        Some(IoPort::new(num, format!("tcp-{}", num), self.dialer.clone()))
    }

    async fn release_port(&self, port: IoPort, final_state: SessionState, _was_connect_error: bool) {
        if !self.allocated.lock().remove(&port.port_num()) {
            warn!("release of unknown port {}", port.port_name());
        }
        debug!("released {} ({})", port.port_name(), final_state);
    }

    fn num_ports(&self) -> usize {
        self.max_sockets
    }

    fn num_free_ports(&self) -> usize {
        self.max_sockets - self.allocated.lock().len()
    }

    async fn close(&self) {
        let mut allocated = self.allocated.lock();
        if !allocated.is_empty() {
            warn!("closing tcp-client pool with {} ports still leased", allocated.len());
        }
        allocated.clear();
    }
}
