//! Serving stations that call in
//!
//! For every accepted client:
//! 1. hang up at once if the session limit is reached
//! 2. run the login challenge, if one is configured
//! 3. read the identification line; it must name a known medium id
//! 4. run a `PollSession` over the accepted socket
//!
//! Finished sessions are reaped periodically; shutdown waits a bounded
//! time for the rest before closing the pool.

use crate::constants::{CLIENT_IDENT_TIMEOUT_SECS, REAP_INTERVAL_SECS, SHUTDOWN_GRACE_SECS};
use crate::error::{PollError, Result};
use crate::port::listen::ClientAuth;
use crate::port::{IoPort, ListeningPool, PortPool, SessionState};
use crate::session::{PollSession, SessionContext};
use crate::station::StationTarget;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest identification or password line accepted
const MAX_LINE: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenSummary {
    pub clients: usize,
    pub sessions: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Hung up because every session slot was busy
    pub rejected: usize,
    /// Failed the challenge, sent an unknown id, or never identified
    pub unidentified: usize,
    /// Sessions still running when the shutdown grace period ran out
    pub aborted: usize,
}

pub struct ListeningController {
    pool: Arc<ListeningPool>,
    /// Known stations by medium id
    stations: Arc<HashMap<String, Arc<StationTarget>>>,
    ctx: SessionContext,
    max_sessions: usize,
    ident_timeout: Duration,
    reap_interval: Duration,
    grace: Duration,
    summary: Arc<Mutex<ListenSummary>>,
}

impl ListeningController {
    /// `ctx.pool` should be the same pool as `pool`
    pub fn new(pool: Arc<ListeningPool>, stations: Vec<StationTarget>, ctx: SessionContext) -> Self {
        let stations = stations
            .into_iter()
            .map(|s| (s.medium_id.trim().to_string(), Arc::new(s)))
            .collect();
        Self {
            max_sessions: pool.num_ports(),
            pool,
            stations: Arc::new(stations),
            ctx,
            ident_timeout: Duration::from_secs(CLIENT_IDENT_TIMEOUT_SECS),
            reap_interval: Duration::from_secs(REAP_INTERVAL_SECS),
            grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
            summary: Arc::new(Mutex::new(ListenSummary::default())),
        }
    }

    pub fn with_ident_timeout(mut self, timeout: Duration) -> Self {
        self.ident_timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn summary(&self) -> ListenSummary {
        self.summary.lock().clone()
    }

    /// Serve clients until shutdown
    pub async fn run(&self) -> ListenSummary {
        let shutdown = self.ctx.shutdown.clone();
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();
        let mut reap = tokio::time::interval(self.reap_interval);
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "serving {} known stations on {}, up to {} at once",
            self.stations.len(),
            self.pool.local_addr(),
            self.max_sessions
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = reap.tick() => {
                    sessions.retain(|h| !h.is_finished());
                    let s = self.summary();
                    debug!(
                        "{} active, {} sessions so far ({} ok, {} failed)",
                        sessions.len(), s.sessions, s.succeeded, s.failed
                    );
                }
                port = self.pool.wait_for_client() => {
                    let Some(port) = port else { break };
                    sessions.retain(|h| !h.is_finished());
                    self.summary.lock().clients += 1;
                    if sessions.len() >= self.max_sessions {
                        warn!(
                            "session limit {} reached, hanging up on {:?}",
                            self.max_sessions,
                            port.peer()
                        );
                        self.summary.lock().rejected += 1;
                        self.pool.release_port(port, SessionState::Failed, false).await;
                        continue;
                    }
                    sessions.push(tokio::spawn(self.serve(port)));
                }
            }
        }

        sessions.retain(|h| !h.is_finished());
        if !sessions.is_empty() {
            info!("waiting up to {:?} for {} sessions", self.grace, sessions.len());
            let deadline = tokio::time::Instant::now() + self.grace;
            for handle in sessions.iter_mut() {
                if tokio::time::timeout_at(deadline, handle).await.is_err() {
                    break;
                }
            }
            let stuck: Vec<_> = sessions.iter().filter(|h| !h.is_finished()).collect();
            if !stuck.is_empty() {
                warn!("{} sessions did not stop in time, aborting", stuck.len());
                for handle in &stuck {
                    handle.abort();
                }
                self.summary.lock().aborted += stuck.len();
            }
        }
        self.pool.close().await;
        self.ctx.sink.complete().await;

        let summary = self.summary();
        info!(
            "listening stopped: {} clients, {} sessions ({} ok, {} failed, {} aborted)",
            summary.clients, summary.sessions, summary.succeeded, summary.failed, summary.aborted
        );
        summary
    }

    /// Task serving one accepted client
    fn serve(&self, mut port: IoPort) -> impl std::future::Future<Output = ()> + Send + 'static {
        let pool = self.pool.clone();
        let stations = self.stations.clone();
        let ctx = self.ctx.clone();
        let summary = self.summary.clone();
        let timeout = self.ident_timeout;

        async move {
            let peer = port.peer();
            let target = match identify(&mut port, pool.auth(), &stations, timeout).await {
                Ok(target) => target,
                Err(e) => {
                    warn!(?peer, "dropping client: {}", e);
                    summary.lock().unidentified += 1;
                    pool.release_port(port, SessionState::Failed, false).await;
                    return;
                }
            };

            info!(station = %target.name, ?peer, "station identified");
            summary.lock().sessions += 1;
            let outcome = PollSession::new(target, ctx).run(port).await;
            {
                let mut s = summary.lock();
                if outcome.state == SessionState::Success {
                    s.succeeded += 1;
                } else {
                    s.failed += 1;
                }
            }
            pool.release_port(outcome.port, outcome.state, outcome.was_connect_error)
                .await;
        }
    }
}

/// Run the challenge and match the identification line to a station
async fn identify(
    port: &mut IoPort,
    auth: &ClientAuth,
    stations: &HashMap<String, Arc<StationTarget>>,
    timeout: Duration,
) -> Result<Arc<StationTarget>> {
    if let ClientAuth::Password { prompt, value } = auth {
        port.write_all(prompt)
            .await
            .map_err(|e| PollError::login(format!("cannot send prompt: {}", e)))?;
        let answer = read_line(port, timeout).await?;
        if answer != *value {
            return Err(PollError::login("bad password"));
        }
    }

    let id = read_line(port, timeout).await?;
    stations
        .get(&id)
        .cloned()
        .ok_or_else(|| PollError::login(format!("unknown station id '{}'", id)))
}

/// Read one line (`\r` or `\n` terminated), trimmed
///
/// Reads byte by byte so nothing after the line is consumed.
async fn read_line(port: &mut IoPort, timeout: Duration) -> Result<String> {
    let mut input = port
        .take_input()
        .ok_or_else(|| PollError::login("client has no input stream"))?;

    let read = async {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match input.read(&mut byte).await {
                Ok(0) => return Err(PollError::login("client hung up")),
                Ok(_) => match byte[0] {
                    b'\r' | b'\n' if line.iter().all(u8::is_ascii_whitespace) => line.clear(),
                    b'\r' | b'\n' => return Ok(line),
                    b => {
                        line.push(b);
                        if line.len() > MAX_LINE {
                            return Err(PollError::login("identification line too long"));
                        }
                    }
                },
                Err(e) => return Err(PollError::login(format!("read failed: {}", e))),
            }
        }
    };
    let result = tokio::time::timeout(timeout, read).await;
    port.restore_input(input);

    let line = result.map_err(|_| PollError::login(format!("no identification within {:?}", timeout)))??;
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::MediumType;

    fn stations() -> HashMap<String, Arc<StationTarget>> {
        let s = StationTarget::new("CALLER", MediumType::Incoming, "CALLER01", "x");
        HashMap::from([(s.medium_id.clone(), Arc::new(s))])
    }

    #[tokio::test]
    async fn test_identify_known_station() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut port = IoPort::from_stream(0, "client-0", server);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"\r\nCALLER01\r\nDATA")
            .await
            .unwrap();

        let target = identify(&mut port, &ClientAuth::None, &stations(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(target.name, "CALLER");

        // Bytes after the line stay on the port
        let mut rest = [0u8; 4];
        port.take_input().unwrap().read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"DATA");
    }

    #[tokio::test]
    async fn test_password_challenge() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut port = IoPort::from_stream(0, "client-0", server);
        let auth = ClientAuth::parse("password=Password: =s3cret").unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"wrong\r")
            .await
            .unwrap();

        let err = identify(&mut port, &auth, &stations(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad password"));

        let mut prompt = [0u8; 10];
        client.read_exact(&mut prompt).await.unwrap();
        assert_eq!(&prompt, b"Password: ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let (_client, server) = tokio::io::duplex(256);
        let mut port = IoPort::from_stream(0, "client-0", server);
        let err = identify(&mut port, &ClientAuth::None, &stations(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Login { .. }));
        assert!(port.take_input().is_some());
    }
}
