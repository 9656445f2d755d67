//! Raw session files.
//!
//! When a session-file template is configured, every byte exchanged with a
//! station is written to its own file. Session I/O must never stall on disk,
//! so writing is implemented as:
//! - a bounded queue (non-blocking `try_send`)
//! - a dedicated thread with buffered writes and periodic flush
//!
//! The writer thread exits and flushes once every `SessionLog` clone is dropped.

use crate::protocol::expand::format_java_date;
use crate::station::StationTarget;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const QUEUE_CAPACITY: usize = 1024;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

enum Chunk {
    Received(Vec<u8>),
    Sent(Vec<u8>),
    Note(String),
}

/// Handle to an open session file
#[derive(Clone)]
pub struct SessionLog {
    tx: SyncSender<Chunk>,
    path: PathBuf,
}

impl SessionLog {
    /// Create (truncate) `path` and start its writer thread
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let (tx, rx) = sync_channel::<Chunk>(QUEUE_CAPACITY);

        thread::Builder::new()
            .name("dcp-session-log".to_string())
            .spawn(move || run_writer(rx, file))?;

        Ok(Self { tx, path })
    }

    /// Open the file named by `template` for this station
    pub fn for_station(template: &str, target: &StationTarget, now: DateTime<Utc>) -> io::Result<Self> {
        Self::open(expand_template(template, target, now))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes received from the station, written verbatim
    pub fn received(&self, data: &[u8]) {
        let _ = self.tx.try_send(Chunk::Received(data.to_vec()));
    }

    /// Bytes sent to the station
    pub fn sent(&self, data: &[u8]) {
        let _ = self.tx.try_send(Chunk::Sent(data.to_vec()));
    }

    /// Free-text annotation
    pub fn note(&self, message: impl Into<String>) {
        let _ = self.tx.try_send(Chunk::Note(message.into()));
    }
}

fn run_writer(rx: Receiver<Chunk>, file: File) {
    let mut writer = BufWriter::new(file);
    let mut dirty = false;
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(FLUSH_INTERVAL) {
            Ok(chunk) => {
                if let Err(e) = write_chunk(&mut writer, chunk) {
                    warn!("session log write failed: {}", e);
                    break;
                }
                dirty = true;
            }
            Err(RecvTimeoutError::Timeout) => {
                if dirty && last_flush.elapsed() >= FLUSH_INTERVAL {
                    let _ = writer.flush();
                    dirty = false;
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = writer.flush();
}

fn write_chunk(writer: &mut BufWriter<File>, chunk: Chunk) -> io::Result<()> {
    match chunk {
        Chunk::Received(data) => writer.write_all(&data),
        Chunk::Sent(data) => {
            writer.write_all(b"\n>>> ")?;
            writer.write_all(&data)?;
            writer.write_all(b"\n")
        }
        Chunk::Note(message) => writeln!(writer, "\n### {}", message),
    }
}

/// Expand `$MEDIUMID`, `$STATION` and `$DATE(fmt)` in a file-name template
///
/// `fmt` uses Java-style date letters (`yyyyMMdd-HHmmss`).
pub fn expand_template(template: &str, target: &StationTarget, now: DateTime<Utc>) -> PathBuf {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        if let Some(after) = strip_prefix_ignore_case(tail, "DATE(") {
            if let Some(close) = after.find(')') {
                out.push_str(&format_java_date(&after[..close], &now.with_timezone(&target.offset())));
                rest = &after[close + 1..];
                continue;
            }
        }
        if let Some(after) = strip_prefix_ignore_case(tail, "MEDIUMID") {
            out.push_str(&sanitize(&target.medium_id));
            rest = after;
            continue;
        }
        if let Some(after) = strip_prefix_ignore_case(tail, "STATION") {
            out.push_str(&sanitize(&target.name));
            rest = after;
            continue;
        }
        out.push('$');
        rest = tail;
    }
    out.push_str(rest);
    PathBuf::from(out)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Medium ids may contain `:` or `/`; keep file names flat
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn station() -> StationTarget {
        toml::from_str(
            r#"
name = "BIGRIVER"
medium_id = "10.0.0.5:4001"
logger_type = "h555"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_expand_template() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = expand_template("sessions/$MEDIUMID-$DATE(yyyyMMdd-HHmmss).log", &station(), now);
        assert_eq!(path, PathBuf::from("sessions/10.0.0.5_4001-20240309-140507.log"));
    }

    #[test]
    fn test_expand_template_keeps_unknown_tokens() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let path = expand_template("$station/$HOME.log", &station(), now);
        assert_eq!(path, PathBuf::from("BIGRIVER/$HOME.log"));
    }

    #[test]
    fn test_session_log_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.log");
        let log = SessionLog::open(&path).unwrap();
        log.sent(b"AT\r");
        log.received(b"OK\r\n");
        drop(log);

        // Writer thread flushes on disconnect
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let text = fs::read_to_string(&path).unwrap_or_default();
            if text.contains("OK") {
                assert!(text.contains(">>> AT"));
                break;
            }
            assert!(Instant::now() < deadline, "session log not flushed");
            thread::sleep(Duration::from_millis(20));
        }
    }
}
