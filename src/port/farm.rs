//! Device-farm pool
//!
//! A terminal server exposes numbered serial ports (usually modems) as TCP
//! ports `port_base + n`. Several poller processes may share one farm, so
//! ownership of each port is recorded in the status store under
//! `<host>:<n>`:
//! - a port is free when its record is not in use, or the in-use record has
//!   seen no activity for 5 minutes (a crashed owner)
//! - a claim is written, then re-read after a short pause; if another
//!   process claimed the port in between, this one cedes
//!
//! Locally each port rests 2 s after every release, and 2 minutes after
//! three consecutive connect errors.

use super::configurator::{PortConfigurator, ShellSettings, TelnetConfigurator};
use super::{IoPort, PortPool, SessionState};
use crate::config::FarmPoolSettings;
use crate::constants::{
    PORT_CLAIM_CONFIRM_SECS, PORT_DISABLE_SECS, PORT_MAX_CONNECT_ERRORS, PORT_REST_SECS,
    PORT_STALE_SECS,
};
use crate::dialer::{line_dialer, NullDialer};
use crate::error::{PollError, Result};
use crate::station::StationTarget;
use crate::status::{DeviceStatus, StatusStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Who holds a port, as written to its status record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub process: String,
    pub host: String,
}

impl Identity {
    /// This process: `<process_name>-<pid>` on the local host name
    pub fn local(process_name: &str) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            process: format!("{}-{}", process_name, std::process::id()),
            host,
        }
    }

    fn owns(&self, rec: &DeviceStatus) -> bool {
        rec.in_use
            && rec.last_used_by_proc.as_deref() == Some(self.process.as_str())
            && rec.last_used_by_host.as_deref() == Some(self.host.as_str())
    }
}

/// Local per-port bookkeeping
#[derive(Debug, Default)]
struct PortStats {
    consecutive_errors: u32,
    rest_until: Option<Instant>,
}

struct FarmState {
    next: usize,
    stats: HashMap<u32, PortStats>,
}

pub struct DeviceFarmPool {
    host: String,
    port_base: u16,
    ports: Vec<u32>,
    identity: Identity,
    store: Arc<dyn StatusStore>,
    configurator: Option<Arc<dyn PortConfigurator>>,
    connect_timeout: Duration,
    claim_confirm: Duration,
    /// Serializes allocation and release
    state: tokio::sync::Mutex<FarmState>,
    leased: Mutex<BTreeSet<u32>>,
}

impl DeviceFarmPool {
    pub fn from_config(
        settings: &FarmPoolSettings,
        store: Arc<dyn StatusStore>,
        process_name: &str,
    ) -> Result<Self> {
        if settings.host.trim().is_empty() {
            return Err(PollError::config("device-farm pool requires 'host'"));
        }
        let ports = super::parse_port_list(&settings.ports)?;
        if let Some(&max) = ports.last() {
            if u32::from(settings.port_base) + max > u32::from(u16::MAX) {
                return Err(PollError::config(format!(
                    "port {} is beyond the TCP range with port_base {}",
                    max, settings.port_base
                )));
            }
        }

        let mut pool = Self::new(
            settings.host.trim(),
            settings.port_base,
            ports,
            store,
            Identity::local(process_name),
        );
        pool.connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
        if !settings.skip_configure {
            let mut shell = ShellSettings::new(settings.host.trim());
            shell.username = settings.username.clone();
            shell.password = settings.password.clone();
            shell.prompt = settings.prompt.clone();
            pool.configurator = Some(Arc::new(TelnetConfigurator::spawn(shell)));
        }
        Ok(pool)
    }

    /// Pool without a configurator
    pub fn new(
        host: impl Into<String>,
        port_base: u16,
        ports: Vec<u32>,
        store: Arc<dyn StatusStore>,
        identity: Identity,
    ) -> Self {
        let stats = ports.iter().map(|&n| (n, PortStats::default())).collect();
        Self {
            host: host.into(),
            port_base,
            ports,
            identity,
            store,
            configurator: None,
            connect_timeout: Duration::from_secs(crate::constants::DEFAULT_CONNECT_TIMEOUT_SECS),
            claim_confirm: Duration::from_secs(PORT_CLAIM_CONFIRM_SECS),
            state: tokio::sync::Mutex::new(FarmState { next: 0, stats }),
            leased: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_configurator(mut self, configurator: Arc<dyn PortConfigurator>) -> Self {
        self.configurator = Some(configurator);
        self
    }

    pub fn device_name(&self, port_num: u32) -> String {
        format!("{}:{}", self.host, port_num)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn read_record(&self, name: &str) -> Option<DeviceStatus> {
        match self.store.read_device(name).await {
            Ok(rec) => Some(rec.unwrap_or_else(|| DeviceStatus::new(name))),
            Err(e) => {
                warn!("cannot read status of {}: {}", name, e);
                None
            }
        }
    }

    async fn write_record(&self, rec: &DeviceStatus) {
        if let Err(e) = self.store.write_device(rec).await {
            warn!("cannot write status of {}: {}", rec.device_name, e);
        }
    }

    /// Try to take one port: claim, pause, confirm
    async fn try_claim(&self, port_num: u32) -> bool {
        let name = self.device_name(port_num);
        let Some(mut rec) = self.read_record(&name).await else {
            return false;
        };

        let now = Utc::now();
        if rec.in_use {
            let stale = rec
                .last_activity_time
                .map(|t| (now - t).num_seconds() > PORT_STALE_SECS)
                .unwrap_or(true);
            if !stale {
                return false;
            }
            warn!(
                "{} in use by {:?}@{:?} with no activity since {:?}; taking over",
                name, rec.last_used_by_proc, rec.last_used_by_host, rec.last_activity_time
            );
        }

        rec.in_use = true;
        rec.last_used_by_proc = Some(self.identity.process.clone());
        rec.last_used_by_host = Some(self.identity.host.clone());
        rec.last_activity_time = Some(now);
        rec.port_status = "Allocated".to_string();
        self.write_record(&rec).await;

        tokio::time::sleep(self.claim_confirm).await;

        match self.read_record(&name).await {
            Some(rec) if self.identity.owns(&rec) => true,
            Some(rec) => {
                info!(
                    "{} claimed by {:?}@{:?}; ceding",
                    name, rec.last_used_by_proc, rec.last_used_by_host
                );
                false
            }
            None => {
                // Ownership unconfirmed: drop our claim
                rec.in_use = false;
                rec.port_status = "Available".to_string();
                self.write_record(&rec).await;
                false
            }
        }
    }
}

#[async_trait]
impl PortPool for DeviceFarmPool {
    fn name(&self) -> &str {
        "device-farm"
    }

    async fn allocate_port(&self) -> Option<IoPort> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        for _ in 0..self.ports.len() {
            let port_num = self.ports[state.next];
            state.next = (state.next + 1) % self.ports.len();

            if self.leased.lock().contains(&port_num) {
                continue;
            }
            let resting = state
                .stats
                .get(&port_num)
                .and_then(|s| s.rest_until)
                .map(|until| until > now)
                .unwrap_or(false);
            if resting {
                continue;
            }

            if self.try_claim(port_num).await {
                self.leased.lock().insert(port_num);
                debug!("allocated {}", self.device_name(port_num));
                return Some(IoPort::new(
                    port_num,
                    self.device_name(port_num),
                    Arc::new(NullDialer),
                ));
            }
        }
        None
    }

    async fn config_port(&self, port: &mut IoPort, target: &StationTarget) -> Result<()> {
        let name = port.port_name().to_string();
        if let Some(mut rec) = self.read_record(&name).await {
            rec.port_status = format!("Configuring for {}", target.medium_id);
            rec.media_id = Some(target.medium_id.clone());
            rec.last_activity_time = Some(Utc::now());
            self.write_record(&rec).await;
        }

        if let Some(ref configurator) = self.configurator {
            port.set_configure_state(SessionState::Running);
            match configurator.configure(port.port_num(), target).await {
                Ok(()) => port.set_configure_state(SessionState::Success),
                Err(e) => {
                    port.set_configure_state(SessionState::Failed);
                    return Err(e);
                }
            }
        }

        let tcp_port = u32::from(self.port_base) + port.port_num();
        let addr = format!("{}:{}", self.host, tcp_port);
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(PollError::Dial {
                    target: addr,
                    reason: "farm port connect failed".into(),
                    source: Some(e),
                })
            }
            Err(_) => return Err(PollError::dial(addr, "farm port did not answer")),
        };
        let _ = stream.set_nodelay(true);
        port.set_peer(stream.peer_addr().ok());
        port.attach(stream);
        port.set_dialer(line_dialer(target));
        debug!("{} open via {}", name, addr);
        Ok(())
    }

    async fn release_port(&self, mut port: IoPort, final_state: SessionState, was_connect_error: bool) {
        port.close_streams().await;
        let port_num = port.port_num();
        let mut state = self.state.lock().await;

        let stats = state.stats.entry(port_num).or_default();
        let now = Instant::now();
        if was_connect_error {
            stats.consecutive_errors += 1;
        } else {
            stats.consecutive_errors = 0;
        }
        if stats.consecutive_errors >= PORT_MAX_CONNECT_ERRORS {
            warn!(
                "{} failed to connect {} times in a row; disabled for {}s",
                port.port_name(),
                stats.consecutive_errors,
                PORT_DISABLE_SECS
            );
            stats.consecutive_errors = 0;
            stats.rest_until = Some(now + Duration::from_secs(PORT_DISABLE_SECS as u64));
        } else {
            stats.rest_until = Some(now + Duration::from_secs(PORT_REST_SECS as u64));
        }

        if let Some(mut rec) = self.read_record(port.port_name()).await {
            // A stale-override by another process keeps its claim
            if self.identity.owns(&rec) {
                let t = Utc::now();
                rec.in_use = false;
                rec.last_activity_time = Some(t);
                match final_state {
                    SessionState::Success => rec.last_receive_time = Some(t),
                    SessionState::Failed => rec.last_error_time = Some(t),
                    _ => {}
                }
                rec.port_status = if was_connect_error {
                    "Available (connect error)".to_string()
                } else {
                    "Available".to_string()
                };
                self.write_record(&rec).await;
            }
        }

        self.leased.lock().remove(&port_num);
        debug!("released {} ({})", port.port_name(), final_state);
    }

    fn num_ports(&self) -> usize {
        self.ports.len()
    }

    fn num_free_ports(&self) -> usize {
        self.ports.len() - self.leased.lock().len()
    }

    async fn close(&self) {
        let leased: Vec<u32> = std::mem::take(&mut *self.leased.lock()).into_iter().collect();
        for port_num in leased {
            let name = self.device_name(port_num);
            warn!("{} still allocated at close", name);
            if let Some(mut rec) = self.read_record(&name).await {
                if self.identity.owns(&rec) {
                    rec.in_use = false;
                    rec.last_error_time = Some(Utc::now());
                    rec.port_status = "Closed while allocated".to_string();
                    self.write_record(&rec).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MemoryStatusStore;

    fn identity(process: &str) -> Identity {
        Identity {
            process: process.into(),
            host: "poller1".into(),
        }
    }

    fn pool(ports: Vec<u32>, store: Arc<dyn StatusStore>) -> DeviceFarmPool {
        DeviceFarmPool::new("farm", 2100, ports, store, identity("me"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_allocate_round_robin_and_exhaust() {
        let store = MemoryStatusStore::shared();
        let pool = pool(vec![1, 2], store.clone());

        let a = pool.allocate_port().await.unwrap();
        let b = pool.allocate_port().await.unwrap();
        assert_eq!((a.port_num(), b.port_num()), (1, 2));
        assert!(pool.allocate_port().await.is_none());
        assert_eq!(pool.num_free_ports(), 0);

        let rec = store.read_device("farm:1").await.unwrap().unwrap();
        assert!(pool.identity().owns(&rec));
    }

    struct RefusingConfigurator;

    #[async_trait]
    impl PortConfigurator for RefusingConfigurator {
        async fn configure(&self, port_num: u32, _target: &StationTarget) -> Result<()> {
            Err(PollError::config(format!("port {} rejected settings", port_num)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_failure_stops_connect() {
        let store = MemoryStatusStore::shared();
        let pool = pool(vec![3], store.clone()).with_configurator(Arc::new(RefusingConfigurator));
        let target = StationTarget::new("S", crate::station::MediumType::PolledModem, "5551234", "h555");

        let mut port = pool.allocate_port().await.unwrap();
        let err = pool.config_port(&mut port, &target).await.unwrap_err();
        assert!(matches!(err, PollError::Config { .. }));
        assert_eq!(port.configure_state(), SessionState::Failed);
        assert!(!port.is_connected());

        let rec = store.read_device("farm:3").await.unwrap().unwrap();
        assert_eq!(rec.media_id.as_deref(), Some("5551234"));
        pool.release_port(port, SessionState::Failed, true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_rests_port() {
        let store = MemoryStatusStore::shared();
        let pool = pool(vec![7], store.clone());

        let port = pool.allocate_port().await.unwrap();
        pool.release_port(port, SessionState::Success, false).await;

        let rec = store.read_device("farm:7").await.unwrap().unwrap();
        assert!(!rec.in_use);
        assert!(rec.last_receive_time.is_some());

        // Resting right after release
        assert!(pool.allocate_port().await.is_none());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(pool.allocate_port().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_connect_errors_disable_port() {
        let store = MemoryStatusStore::shared();
        let pool = pool(vec![3], store);

        for _ in 0..PORT_MAX_CONNECT_ERRORS {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let port = pool.allocate_port().await.unwrap();
            pool.release_port(port, SessionState::Failed, true).await;
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(pool.allocate_port().await.is_none());
        tokio::time::sleep(Duration::from_secs(PORT_DISABLE_SECS as u64)).await;
        assert!(pool.allocate_port().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_claim_respected_unless_stale() {
        let store = MemoryStatusStore::shared();
        let mut busy = DeviceStatus::new("farm:1");
        busy.in_use = true;
        busy.last_used_by_proc = Some("other".into());
        busy.last_activity_time = Some(Utc::now());
        store.write_device(&busy).await.unwrap();

        let mut stale = DeviceStatus::new("farm:2");
        stale.in_use = true;
        stale.last_used_by_proc = Some("crashed".into());
        stale.last_activity_time = Some(Utc::now() - chrono::Duration::minutes(10));
        store.write_device(&stale).await.unwrap();

        let pool = pool(vec![1, 2], store);
        let port = pool.allocate_port().await.unwrap();
        assert_eq!(port.port_num(), 2);
        assert!(pool.allocate_port().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cedes_when_claim_overwritten() {
        let store = MemoryStatusStore::shared();
        let pool = pool(vec![1], store.clone());

        let rival = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let mut rec = DeviceStatus::new("farm:1");
            rec.in_use = true;
            rec.last_used_by_proc = Some("rival".into());
            rec.last_used_by_host = Some("poller2".into());
            rec.last_activity_time = Some(Utc::now());
            store.write_device(&rec).await.unwrap();
        });

        assert!(pool.allocate_port().await.is_none());
        rival.await.unwrap();
        assert_eq!(pool.num_free_ports(), 1);
    }

    /// Store whose device reads fail once `fail_reads` is set
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStatusStore,
        fail_reads: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl StatusStore for FlakyStore {
        async fn read_device(&self, name: &str) -> Result<Option<DeviceStatus>> {
            if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(PollError::Status {
                    message: "store offline".into(),
                });
            }
            self.inner.read_device(name).await
        }

        async fn write_device(&self, status: &DeviceStatus) -> Result<()> {
            self.inner.write_device(status).await
        }

        async fn read_platform(&self, key: &str) -> Result<Option<crate::status::PlatformStatus>> {
            self.inner.read_platform(key).await
        }

        async fn write_platform(&self, status: &crate::status::PlatformStatus) -> Result<()> {
            self.inner.write_platform(status).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_claim_is_given_back() {
        let store = Arc::new(FlakyStore::default());
        let pool = pool(vec![1], store.clone());

        let outage = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                store.fail_reads.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        };

        assert!(pool.allocate_port().await.is_none());
        outage.await.unwrap();
        assert_eq!(pool.num_free_ports(), 1);

        let rec = store.inner.read_device("farm:1").await.unwrap().unwrap();
        assert!(!rec.in_use);
        assert_eq!(rec.port_status, "Available");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_clears_held_records() {
        let store = MemoryStatusStore::shared();
        let pool = pool(vec![1], store.clone());
        let _held = pool.allocate_port().await.unwrap();

        pool.close().await;
        let rec = store.read_device("farm:1").await.unwrap().unwrap();
        assert!(!rec.in_use);
        assert!(rec.last_error_time.is_some());
    }

    #[test]
    fn test_from_config_requires_host() {
        let settings = FarmPoolSettings {
            ports: "1-4".into(),
            ..Default::default()
        };
        assert!(matches!(
            DeviceFarmPool::from_config(&settings, MemoryStatusStore::shared(), "dcp-poll"),
            Err(PollError::Config { .. })
        ));
    }
}
