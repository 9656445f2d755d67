//! One polling session against one station
//!
//! A `PollSession` owns its leased `IoPort` for the duration of the run and
//! hands it back in the `SessionOutcome` so the controller can release it.
//! Steps:
//! 1. read the station's status record
//! 2. connect the port (pool preparation, then the dialer)
//! 3. build the logger protocol and open the optional session log
//! 4. login, get data since the computed start, enqueue the message, goodbye
//!
//! The port is disconnected on every path, panics included.

use crate::config::PollerSettings;
use crate::error::{PollError, Result};
use crate::logging::SessionLog;
use crate::port::{IoPort, PortPool, SessionState};
use crate::protocol::{LoggerProtocol, ProtocolFactory};
use crate::shutdown::Shutdown;
use crate::sink::MessageSink;
use crate::station::StationTarget;
use crate::status::{PlatformStatus, StatusStore};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every session of one controller
#[derive(Clone)]
pub struct SessionContext {
    pub pool: Arc<dyn PortPool>,
    pub factory: Arc<ProtocolFactory>,
    pub store: Arc<dyn StatusStore>,
    pub sink: MessageSink,
    pub settings: Arc<PollerSettings>,
    pub shutdown: Shutdown,
}

/// Where a session was when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Start,
    Connect,
    Protocol,
    Login,
    GetData,
    Enqueue,
    Goodbye,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Connect => "connect",
            Self::Protocol => "protocol setup",
            Self::Login => "login",
            Self::GetData => "get data",
            Self::Enqueue => "enqueue",
            Self::Goodbye => "goodbye",
        };
        f.write_str(s)
    }
}

/// Result of a finished session; carries the port back for release
#[derive(Debug)]
pub struct SessionOutcome {
    pub port: IoPort,
    pub state: SessionState,
    /// The failure happened while establishing the transport
    pub was_connect_error: bool,
    /// Failure cause for `Failed` sessions
    pub error: Option<String>,
}

pub struct PollSession {
    target: Arc<StationTarget>,
    ctx: SessionContext,
}

impl PollSession {
    pub fn new(target: Arc<StationTarget>, ctx: SessionContext) -> Self {
        Self { target, ctx }
    }

    /// Run to completion over `port`
    pub async fn run(self, mut port: IoPort) -> SessionOutcome {
        let mut step = Step::Start;
        let caught = AssertUnwindSafe(self.execute(&mut port, &mut step))
            .catch_unwind()
            .await;
        port.disconnect().await;

        let name = &self.target.name;
        let (state, error) = match caught {
            Ok(Ok(())) => {
                info!(station = %name, port = port.port_name(), "session complete");
                (SessionState::Success, None)
            }
            Ok(Err(e)) => {
                if self.ctx.shutdown.is_triggered() {
                    info!(station = %name, step = %step, "session stopped by shutdown");
                } else {
                    error!(station = %name, step = %step, kind = ?e.kind(), "session failed: {}", e);
                    self.record_error(&format!("{} failed: {}", step, e)).await;
                }
                (SessionState::Failed, Some(e.to_string()))
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(station = %name, step = %step, "defect: session panicked: {}", msg);
                self.record_error(&format!("internal error during {}: {}", step, msg))
                    .await;
                (SessionState::Failed, Some(format!("panic: {}", msg)))
            }
        };

        SessionOutcome {
            port,
            state,
            was_connect_error: state == SessionState::Failed && step == Step::Connect,
            error,
        }
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.ctx.shutdown.is_triggered() {
            return Err(PollError::protocol("shutdown requested"));
        }
        Ok(())
    }

    async fn execute(&self, port: &mut IoPort, step: &mut Step) -> Result<()> {
        let target = self.target.as_ref();
        let mut status = self.read_status().await;

        self.check_shutdown()?;
        *step = Step::Connect;
        debug!(station = %target.name, port = port.port_name(), "connecting to {}", target.medium_id);
        port.connect(self.ctx.pool.as_ref(), target).await?;

        self.check_shutdown()?;
        *step = Step::Protocol;
        let mut protocol = self
            .ctx
            .factory
            .make(&target.logger_type, self.ctx.shutdown.flag())?;
        if let Some(template) = self.ctx.settings.save_session_file.as_deref() {
            match SessionLog::for_station(template, target, Utc::now()) {
                Ok(log) => {
                    log.note(format!("session with {} via {}", target.name, port.port_name()));
                    port.set_session_log(Some(log));
                }
                Err(e) => warn!(station = %target.name, "cannot open session file: {}", e),
            }
        }

        let result = self
            .converse(port, protocol.as_mut(), &mut status, step)
            .await;
        protocol.close(port).await;
        result
    }

    async fn converse(
        &self,
        port: &mut IoPort,
        protocol: &mut dyn LoggerProtocol,
        status: &mut PlatformStatus,
        step: &mut Step,
    ) -> Result<()> {
        let target = self.target.as_ref();

        self.check_shutdown()?;
        *step = Step::Login;
        protocol.login(port, target).await?;

        self.check_shutdown()?;
        *step = Step::GetData;
        let since = compute_since(status.last_message_time, Utc::now(), &self.ctx.settings);
        debug!(station = %target.name, "retrieving data since {}", since);
        let msg = protocol.get_data(port, target, since).await?;

        *step = Step::Enqueue;
        let received = msg.receive_time;
        let bytes = msg.payload().len();
        if self.ctx.sink.enqueue(msg).await {
            status.last_message_time = Some(received);
        }
        status.last_contact_time = Some(received);
        status.annotation = None;
        if let Err(e) = self.ctx.store.write_platform(status).await {
            warn!(station = %target.name, "cannot write station status: {}", e);
        }
        info!(station = %target.name, "retrieved {} bytes", bytes);

        self.check_shutdown()?;
        *step = Step::Goodbye;
        protocol.goodbye(port, target).await
    }

    async fn read_status(&self) -> PlatformStatus {
        let key = self.target.status_key();
        match self.ctx.store.read_platform(&key).await {
            Ok(Some(status)) => status,
            Ok(None) => PlatformStatus::new(key),
            Err(e) => {
                warn!(station = %self.target.name, "cannot read station status: {}", e);
                PlatformStatus::new(key)
            }
        }
    }

    async fn record_error(&self, annotation: &str) {
        let mut status = self.read_status().await;
        status.last_error_time = Some(Utc::now());
        status.annotation = Some(annotation.to_string());
        if let Err(e) = self.ctx.store.write_platform(&status).await {
            warn!(station = %self.target.name, "cannot write station status: {}", e);
        }
    }
}

/// Start of the retrieval window
///
/// One hour before the last message, clamped so the window is at least
/// `min_backlog_hours` and at most `max_backlog_hours` long. Without a
/// previous message the full backlog is requested.
pub fn compute_since(
    last_message: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    settings: &PollerSettings,
) -> DateTime<Utc> {
    let earliest = now - TimeDelta::hours(i64::from(settings.max_backlog_hours));
    let latest = now - TimeDelta::hours(i64::from(settings.min_backlog_hours));
    match last_message {
        Some(t) => (t - TimeDelta::hours(1)).clamp(earliest, latest),
        None => earliest,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggerTypeEntry;
    use crate::port::TcpClientPool;
    use crate::sink::{message_queue, MessageStream};
    use crate::station::MediumType;
    use crate::status::MemoryStatusStore;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    struct Harness {
        _dir: tempfile::TempDir,
        ctx: SessionContext,
        stream: MessageStream,
        store: Arc<dyn StatusStore>,
    }

    fn harness(script: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.poll"), script).unwrap();
        let mut types = HashMap::new();
        types.insert(
            "echo".to_string(),
            LoggerTypeEntry {
                script: "echo.poll".into(),
                lines_per_hour: None,
            },
        );
        let store = MemoryStatusStore::shared();
        let (sink, stream) = message_queue();
        let ctx = SessionContext {
            pool: Arc::new(TcpClientPool::new(2, Duration::from_secs(2))),
            factory: Arc::new(ProtocolFactory::new(dir.path(), types)),
            store: store.clone(),
            sink,
            settings: Arc::new(PollerSettings::default()),
            shutdown: Shutdown::new(),
        };
        Harness {
            _dir: dir,
            ctx,
            stream,
            store,
        }
    }

    /// Station answering `PING` with `PONG` and some data
    async fn ping_station() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut lines = BufReader::new(rd);
            let mut line = Vec::new();
            if lines.read_until(b'\r', &mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let _ = wr.write_all(b"12.5,13.0\r\nPONG\r\n").await;
            let mut rest = Vec::new();
            let _ = lines.read_until(b'\r', &mut rest).await;
        });
        addr
    }

    #[test]
    fn test_compute_since() {
        let settings = PollerSettings::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

        assert_eq!(compute_since(None, now, &settings), now - TimeDelta::hours(48));
        // Recent message: at least the minimum backlog
        let recent = now - TimeDelta::minutes(30);
        assert_eq!(compute_since(Some(recent), now, &settings), now - TimeDelta::hours(2));
        // Within bounds: one hour before the last message
        let last = now - TimeDelta::hours(10);
        assert_eq!(compute_since(Some(last), now, &settings), now - TimeDelta::hours(11));
        // Ancient: capped at the maximum backlog
        let old = now - TimeDelta::days(30);
        assert_eq!(compute_since(Some(old), now, &settings), now - TimeDelta::hours(48));
    }

    #[tokio::test]
    async fn test_successful_session() {
        let mut h = harness("CAPTURE\nXMIT \"PING\\r\"\nWAITR 5, \"PONG\"\nXMIT \"BYE\\r\"\n");
        let addr = ping_station().await;
        let target = Arc::new(StationTarget::new("RIVER1", MediumType::PolledTcp, addr, "echo"));
        let port = h.ctx.pool.allocate_port().await.unwrap();

        let outcome = PollSession::new(target.clone(), h.ctx.clone()).run(port).await;
        assert_eq!(outcome.state, SessionState::Success, "{:?}", outcome.error);
        assert!(!outcome.port.is_connected());

        let msg = h.stream.next().await.unwrap();
        assert_eq!(msg.station, "RIVER1");
        assert!(msg.payload().starts_with(b"12.5,13.0\r\nPONG"));

        let status = h.store.read_platform(&target.status_key()).await.unwrap().unwrap();
        assert_eq!(status.last_message_time, Some(msg.receive_time));
        assert!(status.last_error_time.is_none());
    }

    #[tokio::test]
    async fn test_dial_failure_is_connect_error() {
        let h = harness("XMIT \"x\"\n");
        // Bind then drop to get a port nobody listens on
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };
        let target = Arc::new(StationTarget::new("DEAD", MediumType::PolledTcp, addr, "echo"));
        let port = h.ctx.pool.allocate_port().await.unwrap();

        let outcome = PollSession::new(target.clone(), h.ctx.clone()).run(port).await;
        assert_eq!(outcome.state, SessionState::Failed);
        assert!(outcome.was_connect_error);

        let status = h.store.read_platform(&target.status_key()).await.unwrap().unwrap();
        assert!(status.last_error_time.is_some());
        assert!(status.annotation.unwrap().starts_with("connect failed"));
    }

    #[tokio::test]
    async fn test_unknown_logger_type_fails_after_connect() {
        let h = harness("XMIT \"x\"\n");
        let addr = ping_station().await;
        let target = Arc::new(StationTarget::new("ODD", MediumType::PolledTcp, addr, "nosuch"));
        let port = h.ctx.pool.allocate_port().await.unwrap();

        let outcome = PollSession::new(target, h.ctx.clone()).run(port).await;
        assert_eq!(outcome.state, SessionState::Failed);
        assert!(!outcome.was_connect_error);
        assert!(outcome.error.unwrap().contains("unknown logger type"));
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let h = harness("XMIT \"x\"\n");
        h.ctx.shutdown.trigger();
        let target = Arc::new(StationTarget::new("S", MediumType::PolledTcp, "127.0.0.1:1", "echo"));
        let port = h.ctx.pool.allocate_port().await.unwrap();

        let outcome = PollSession::new(target.clone(), h.ctx.clone()).run(port).await;
        assert_eq!(outcome.state, SessionState::Failed);
        // Shutdown is not a station error
        assert!(h.store.read_platform(&target.status_key()).await.unwrap().is_none());
    }
}
