//! Background stream reader
//!
//! Drains a station's input stream on its own task so the protocol
//! interpreter never blocks on a read. Everything received is kept in a
//! session buffer; a scan cursor separates bytes already examined by
//! `wait` from bytes not yet examined, and a capture collector gathers the
//! bytes destined for the retrieved message.
//!
//! The reader stops when:
//! - `shutdown()` is called (the source is handed back through `join()`)
//! - the source reports end-of-stream or an I/O error
//! - the session exceeds `MAX_SESSION_BYTES`

pub mod pattern;

pub use pattern::PatternMatcher;

use crate::constants::{MAX_SESSION_BYTES, READ_BUFFER_SIZE};
use crate::logging::session::SessionLog;
use crate::port::PortInput;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why the reader stopped reading on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Source reported end-of-stream
    Closed,
    /// Source reported an I/O error
    Error(String),
    /// Session exceeded the hard size cap
    Overflow,
}

#[derive(Default)]
struct SessionBuffer {
    session: Vec<u8>,
    scan_pos: usize,
    capture_on: bool,
    captured: Vec<u8>,
    end: Option<StreamEnd>,
}

impl SessionBuffer {
    /// Returns false once the hard cap is exceeded
    fn append(&mut self, data: &[u8]) -> bool {
        self.session.extend_from_slice(data);
        if self.capture_on {
            self.captured.extend_from_slice(data);
        }
        self.session.len() <= MAX_SESSION_BYTES
    }

    fn scan(&mut self, patterns: &mut [PatternMatcher]) -> Option<usize> {
        while self.scan_pos < self.session.len() {
            let byte = self.session[self.scan_pos];
            self.scan_pos += 1;
            for (i, p) in patterns.iter_mut().enumerate() {
                if p.check(byte) {
                    return Some(i);
                }
            }
        }
        None
    }
}

struct Shared {
    buf: Mutex<SessionBuffer>,
    data: Notify,
    stop: AtomicBool,
    stop_notify: Notify,
}

impl Shared {
    fn finish(&self, end: StreamEnd, label: &str) {
        {
            let mut buf = self.buf.lock();
            if buf.end.is_some() {
                return;
            }
            match &end {
                StreamEnd::Closed => debug!(port = label, "input stream closed"),
                StreamEnd::Error(e) => warn!(port = label, "input error: {}", e),
                StreamEnd::Overflow => warn!(
                    port = label,
                    "session exceeded {} bytes, reader stopped", MAX_SESSION_BYTES
                ),
            }
            buf.end = Some(end);
        }
        self.data.notify_waiters();
    }
}

/// Background reader over one input stream
pub struct StreamReader {
    shared: Arc<Shared>,
    task: JoinHandle<Option<PortInput>>,
}

impl StreamReader {
    /// Start draining `source` on a new task
    ///
    /// `label` identifies the port in log output; `log` receives a copy of
    /// every byte read.
    pub fn spawn(source: PortInput, label: impl Into<String>, log: Option<SessionLog>) -> Self {
        let shared = Arc::new(Shared {
            buf: Mutex::new(SessionBuffer::default()),
            data: Notify::new(),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
        });
        let task = tokio::spawn(read_loop(source, shared.clone(), label.into(), log));
        Self { shared, task }
    }

    /// Wait up to `timeout` for any of `patterns` in bytes not yet scanned
    ///
    /// Returns true on the first complete match (the scan cursor is left just
    /// past it), false at the deadline. An empty pattern list is a plain
    /// delay and returns true.
    pub async fn wait(&self, timeout: Duration, patterns: &mut [PatternMatcher]) -> bool {
        if patterns.is_empty() {
            tokio::time::sleep(timeout).await;
            return true;
        }
        self.wait_for(timeout, patterns).await.is_some()
    }

    /// Like `wait`, but reports which pattern matched
    ///
    /// Returns early with `None` if the stream has ended and every received
    /// byte has been scanned.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        patterns: &mut [PatternMatcher],
    ) -> Option<usize> {
        for p in patterns.iter_mut() {
            p.reset();
        }
        if patterns.is_empty() {
            tokio::time::sleep(timeout).await;
            return None;
        }

        // No deadline when `timeout` runs past what the clock can represent
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.shared.data.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut buf = self.shared.buf.lock();
                if let Some(i) = buf.scan(patterns) {
                    return Some(i);
                }
                if buf.end.is_some() {
                    return None;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        // Bytes may have landed right at the deadline
                        return self.shared.buf.lock().scan(patterns);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Turn capture on or off
    ///
    /// Matching and capture both restart from the current end of the buffer.
    pub fn set_capture(&self, on: bool) {
        let mut buf = self.shared.buf.lock();
        buf.capture_on = on;
        buf.scan_pos = buf.session.len();
    }

    /// Discard unscanned bytes: later waits only see new input
    pub fn flush(&self) {
        let mut buf = self.shared.buf.lock();
        buf.scan_pos = buf.session.len();
    }

    /// Append bytes to the capture collector as if the station had sent them
    pub fn inject_captured(&self, data: &[u8]) {
        self.shared.buf.lock().captured.extend_from_slice(data);
    }

    pub fn captured_data(&self) -> Vec<u8> {
        self.shared.buf.lock().captured.clone()
    }

    /// Everything received this session
    pub fn session_data(&self) -> Vec<u8> {
        self.shared.buf.lock().session.clone()
    }

    /// Why the reader stopped, if it stopped on its own
    pub fn end(&self) -> Option<StreamEnd> {
        self.shared.buf.lock().end.clone()
    }

    /// Stop the read loop; safe to call repeatedly and from any task
    pub fn shutdown(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            self.shared.stop_notify.notify_one();
        }
    }

    /// Stop the reader and take back its source
    ///
    /// Returns `None` when the source ended (closed, error or overflow).
    pub async fn join(self) -> Option<PortInput> {
        self.shutdown();
        self.task.await.ok().flatten()
    }
}

async fn read_loop(
    mut source: PortInput,
    shared: Arc<Shared>,
    label: String,
    log: Option<SessionLog>,
) -> Option<PortInput> {
    let mut chunk = [0u8; READ_BUFFER_SIZE];

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return Some(source);
        }

        let result = tokio::select! {
            biased;
            _ = shared.stop_notify.notified() => None,
            r = source.read(&mut chunk) => Some(r),
        };
        let Some(result) = result else {
            return Some(source);
        };

        match result {
            Ok(0) => {
                shared.finish(StreamEnd::Closed, &label);
                return None;
            }
            Ok(n) => {
                if let Some(ref log) = log {
                    log.received(&chunk[..n]);
                }
                let within_cap = shared.buf.lock().append(&chunk[..n]);
                shared.data.notify_waiters();
                if !within_cap {
                    shared.finish(StreamEnd::Overflow, &label);
                    return None;
                }
            }
            Err(e) => {
                shared.finish(StreamEnd::Error(e.to_string()), &label);
                return None;
            }
        }
    }
}
