//! Session scheduling
//!
//! `PollingController` works through a list of stations over a bounded
//! outbound pool: one session per leased port, retries up to the configured
//! number of tries, bounded shutdown. `ListeningController` serves stations
//! that call in (see `listening`).

pub mod listening;

pub use listening::{ListenSummary, ListeningController};

use crate::constants::{ALLOCATE_BACKOFF_MS, CHANNEL_CAPACITY, SHUTDOWN_GRACE_SECS};
use crate::port::SessionState;
use crate::session::{PollSession, SessionContext, SessionOutcome};
use crate::station::StationTarget;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Final tallies of a polling run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Sessions started, retries included
    pub attempts: usize,
    /// Sessions still running when the shutdown grace period ran out
    pub aborted: usize,
}

/// Scheduling state of one station
#[derive(Debug)]
struct Slot {
    target: Arc<StationTarget>,
    state: SessionState,
    tries: u32,
}

type Completion = (usize, SessionOutcome);

pub struct PollingController {
    slots: Mutex<Vec<Slot>>,
    ctx: SessionContext,
    max_tries: u32,
    backoff: Duration,
    grace: Duration,
    summary: Mutex<PollSummary>,
}

impl PollingController {
    pub fn new(stations: Vec<StationTarget>, ctx: SessionContext) -> Self {
        let max_tries = ctx.settings.poll_num_tries.max(1);
        let slots = stations
            .into_iter()
            .map(|t| Slot {
                target: Arc::new(t),
                state: SessionState::Waiting,
                tries: 0,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            ctx,
            max_tries,
            backoff: Duration::from_millis(ALLOCATE_BACKOFF_MS),
            grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
            summary: Mutex::new(PollSummary::default()),
        }
    }

    /// How long running sessions get to finish after shutdown
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Tallies so far
    pub fn summary(&self) -> PollSummary {
        self.summary.lock().clone()
    }

    /// Poll every station until each one succeeded or ran out of tries,
    /// or until shutdown
    pub async fn run(&self) -> PollSummary {
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(CHANNEL_CAPACITY);
        let mut running: Vec<JoinHandle<()>> = Vec::new();
        let mut cursor = 0usize;
        let shutdown = self.ctx.shutdown.clone();
        let pool = self.ctx.pool.clone();

        info!(
            "polling {} stations over {} pool ({} ports)",
            self.slots.lock().len(),
            pool.name(),
            pool.num_ports()
        );

        loop {
            while let Ok(done) = done_rx.try_recv() {
                self.complete(done).await;
            }
            running.retain(|h| !h.is_finished());

            if shutdown.is_triggered() || !self.has_pending() {
                break;
            }

            let Some(idx) = self.next_waiting(&mut cursor) else {
                // Everything left is running: wait for a completion
                tokio::select! {
                    Some(done) = done_rx.recv() => self.complete(done).await,
                    _ = shutdown.wait() => {}
                }
                continue;
            };

            match pool.allocate_port().await {
                Some(port) => {
                    let target = {
                        let mut slots = self.slots.lock();
                        let slot = &mut slots[idx];
                        slot.state = SessionState::Running;
                        slot.tries += 1;
                        debug!(
                            station = %slot.target.name,
                            "attempt {}/{} on {}", slot.tries, self.max_tries, port.port_name()
                        );
                        slot.target.clone()
                    };
                    self.summary.lock().attempts += 1;

                    let session = PollSession::new(target, self.ctx.clone());
                    let tx = done_tx.clone();
                    running.push(tokio::spawn(async move {
                        let outcome = session.run(port).await;
                        let _ = tx.send((idx, outcome)).await;
                    }));
                }
                None => {
                    tokio::select! {
                        Some(done) = done_rx.recv() => self.complete(done).await,
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = shutdown.wait() => {}
                    }
                }
            }
        }

        self.finish(running, done_rx).await
    }

    fn has_pending(&self) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|s| matches!(s.state, SessionState::Waiting | SessionState::Running))
    }

    /// Next waiting slot at or after the cursor, round-robin
    fn next_waiting(&self, cursor: &mut usize) -> Option<usize> {
        let slots = self.slots.lock();
        let n = slots.len();
        let idx = (0..n)
            .map(|i| (*cursor + i) % n)
            .find(|&i| slots[i].state == SessionState::Waiting)?;
        *cursor = (idx + 1) % n;
        Some(idx)
    }

    /// Release the session's port and settle the station
    async fn complete(&self, (idx, outcome): Completion) {
        let SessionOutcome {
            port,
            state,
            was_connect_error,
            error,
        } = outcome;
        self.ctx
            .pool
            .release_port(port, state, was_connect_error)
            .await;

        let mut slots = self.slots.lock();
        let slot = &mut slots[idx];
        let mut summary = self.summary.lock();
        if state == SessionState::Success {
            slot.state = SessionState::Success;
            summary.succeeded += 1;
        } else if slot.tries < self.max_tries && !self.ctx.shutdown.is_triggered() {
            info!(
                station = %slot.target.name,
                "attempt {}/{} failed ({}), will retry",
                slot.tries,
                self.max_tries,
                error.as_deref().unwrap_or("unknown")
            );
            slot.state = SessionState::Waiting;
        } else {
            warn!(
                station = %slot.target.name,
                "giving up after {} attempts: {}",
                slot.tries,
                error.as_deref().unwrap_or("unknown")
            );
            slot.state = SessionState::Failed;
            summary.failed += 1;
        }
    }

    /// Wait out running sessions, then close the pool and the sink
    async fn finish(
        &self,
        mut running: Vec<JoinHandle<()>>,
        mut done_rx: mpsc::Receiver<Completion>,
    ) -> PollSummary {
        running.retain(|h| !h.is_finished());
        let in_flight = self.count_state(SessionState::Running);
        if in_flight > 0 {
            info!("waiting up to {:?} for {} sessions", self.grace, in_flight);
            let drain = async {
                while self.count_state(SessionState::Running) > 0 {
                    match done_rx.recv().await {
                        Some(done) => self.complete(done).await,
                        None => break,
                    }
                }
            };
            if tokio::time::timeout(self.grace, drain).await.is_err() {
                let stuck = self.count_state(SessionState::Running);
                warn!("{} sessions did not stop in time, aborting", stuck);
                for handle in &running {
                    handle.abort();
                }
                self.fail_running();
                self.summary.lock().aborted += stuck;
            }
        }

        self.ctx.pool.close().await;
        self.ctx.sink.complete().await;

        let summary = self.summary();
        info!(
            "polling complete: {} succeeded, {} failed, {} attempts",
            summary.succeeded, summary.failed, summary.attempts
        );
        summary
    }

    fn count_state(&self, state: SessionState) -> usize {
        self.slots.lock().iter().filter(|s| s.state == state).count()
    }

    fn fail_running(&self) {
        let mut slots = self.slots.lock();
        let mut summary = self.summary.lock();
        for slot in slots.iter_mut().filter(|s| s.state == SessionState::Running) {
            slot.state = SessionState::Failed;
            summary.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoggerTypeEntry, PollerSettings};
    use crate::port::TcpClientPool;
    use crate::protocol::ProtocolFactory;
    use crate::shutdown::Shutdown;
    use crate::sink::message_queue;
    use crate::station::MediumType;
    use crate::status::MemoryStatusStore;
    use std::collections::HashMap;

    fn context(dir: &std::path::Path, max_sockets: usize) -> (SessionContext, crate::sink::MessageStream) {
        std::fs::write(dir.join("noop.poll"), "FLUSH\n").unwrap();
        let mut types = HashMap::new();
        types.insert(
            "noop".to_string(),
            LoggerTypeEntry {
                script: "noop.poll".into(),
                lines_per_hour: None,
            },
        );
        let (sink, stream) = message_queue();
        let ctx = SessionContext {
            pool: Arc::new(TcpClientPool::new(max_sockets, Duration::from_secs(1))),
            factory: Arc::new(ProtocolFactory::new(dir, types)),
            store: MemoryStatusStore::shared(),
            sink,
            settings: Arc::new(PollerSettings::default()),
            shutdown: Shutdown::new(),
        };
        (ctx, stream)
    }

    fn unreachable_station(name: &str) -> StationTarget {
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };
        StationTarget::new(name, MediumType::PolledTcp, addr, "noop")
    }

    #[tokio::test]
    async fn test_failed_station_tried_exactly_n_times() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut stream) = context(dir.path(), 2);
        let pool = ctx.pool.clone();

        let controller = PollingController::new(vec![unreachable_station("DEAD")], ctx);
        let summary = controller.run().await;

        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(pool.num_free_ports(), 2);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_station_list_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut stream) = context(dir.path(), 1);
        let summary = PollingController::new(Vec::new(), ctx).run().await;
        assert_eq!(summary, PollSummary::default());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _stream) = context(dir.path(), 1);
        ctx.shutdown.trigger();
        let stations = vec![unreachable_station("A"), unreachable_station("B")];
        let summary = PollingController::new(stations, ctx).run().await;
        assert_eq!(summary.attempts, 0);
    }

    #[test]
    fn test_round_robin_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _stream) = context(dir.path(), 1);
        let stations = (0..3)
            .map(|i| StationTarget::new(format!("S{}", i), MediumType::PolledTcp, "h", "noop"))
            .collect();
        let controller = PollingController::new(stations, ctx);
        let mut cursor = 0;
        assert_eq!(controller.next_waiting(&mut cursor), Some(0));
        controller.slots.lock()[1].state = SessionState::Running;
        assert_eq!(controller.next_waiting(&mut cursor), Some(2));
        assert_eq!(controller.next_waiting(&mut cursor), Some(0));
    }
}
