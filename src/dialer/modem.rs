//! Hayes-compatible modem dialer
//!
//! Runs over a port whose line is already open (device farm or local
//! serial). Connect sequence:
//! 1. `AT\r`, expect `OK` within 3 s; on silence send `+++`, `ATZ\r` and
//!    retry, three attempts in total
//! 2. `ATDT<number>\r`, expect `CONNECT` within 60 s; `NO CARRIER`, `BUSY`,
//!    `NO DIALTONE` and `NO ANSWER` fail early
//!
//! Disconnect escapes to command mode and resets: `+++`, pause, `ATZ\r`, pause.

use super::Dialer;
use crate::constants::{
    MODEM_CONNECT_WAIT_SECS, MODEM_HANGUP_PAUSE_SECS, MODEM_MAX_ATTEMPTS, MODEM_OK_WAIT_SECS,
};
use crate::error::{PollError, Result};
use crate::port::IoPort;
use crate::reader::{PatternMatcher, StreamReader};
use crate::station::StationTarget;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dial result strings, `CONNECT` first
const DIAL_RESULTS: [&str; 5] = ["CONNECT", "NO CARRIER", "BUSY", "NO DIALTONE", "NO ANSWER"];

pub struct ModemDialer {
    ok_wait: Duration,
    connect_wait: Duration,
    pause: Duration,
    max_attempts: u32,
}

impl Default for ModemDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl ModemDialer {
    pub fn new() -> Self {
        Self {
            ok_wait: Duration::from_secs(MODEM_OK_WAIT_SECS),
            connect_wait: Duration::from_secs(MODEM_CONNECT_WAIT_SECS),
            pause: Duration::from_secs(MODEM_HANGUP_PAUSE_SECS),
            max_attempts: MODEM_MAX_ATTEMPTS,
        }
    }

    async fn send(&self, port: &mut IoPort, data: &str, number: &str) -> Result<()> {
        port.write_all(data.as_bytes())
            .await
            .map_err(|e| PollError::Dial {
                target: number.to_string(),
                reason: format!("write of {:?} failed", data.trim_end()),
                source: Some(e),
            })
    }

    /// Get the modem's attention; true once it answered `OK`
    async fn wake(&self, port: &mut IoPort, reader: &StreamReader, number: &str) -> Result<bool> {
        let mut ok = [PatternMatcher::new("OK")];
        for attempt in 1..=self.max_attempts {
            self.send(port, "AT\r", number).await?;
            if reader.wait(self.ok_wait, &mut ok).await {
                return Ok(true);
            }
            if reader.end().is_some() {
                return Ok(false);
            }
            debug!(
                port = port.port_name(),
                "no OK from modem (attempt {}/{})", attempt, self.max_attempts
            );
            if attempt < self.max_attempts {
                self.send(port, "+++", number).await?;
                tokio::time::sleep(self.pause).await;
                self.send(port, "ATZ\r", number).await?;
                // Let the reset response arrive and discard it
                tokio::time::sleep(self.pause).await;
                reader.flush();
            }
        }
        Ok(false)
    }

    async fn dial(&self, port: &mut IoPort, reader: &StreamReader, number: &str) -> Result<()> {
        if !self.wake(port, reader, number).await? {
            return Err(PollError::dial(
                number,
                format!("modem did not answer AT after {} attempts", self.max_attempts),
            ));
        }

        self.send(port, &format!("ATDT{}\r", number), number).await?;
        let mut results: Vec<PatternMatcher> =
            DIAL_RESULTS.iter().map(|r| PatternMatcher::new(*r)).collect();

        match reader.wait_for(self.connect_wait, &mut results).await {
            Some(0) => Ok(()),
            Some(i) => Err(PollError::dial(number, DIAL_RESULTS[i])),
            None => Err(PollError::dial(
                number,
                format!("no CONNECT within {}s", self.connect_wait.as_secs()),
            )),
        }
    }
}

#[async_trait]
impl Dialer for ModemDialer {
    fn name(&self) -> &'static str {
        "modem"
    }

    async fn connect(&self, port: &mut IoPort, target: &StationTarget) -> Result<()> {
        let number = target.medium_id.trim();
        let input = port
            .take_input()
            .ok_or_else(|| PollError::dial(number, "line not open"))?;
        let reader = StreamReader::spawn(input, port.port_name(), port.session_log().cloned());

        let result = self.dial(port, &reader, number).await;

        if let Some(input) = reader.join().await {
            port.restore_input(input);
        }
        if result.is_ok() {
            info!(station = %target.name, port = port.port_name(), "modem connected to {}", number);
        }
        result
    }

    async fn disconnect(&self, port: &mut IoPort) {
        if !port.is_connected() {
            return;
        }
        debug!(port = port.port_name(), "hanging up modem");
        if port.write_all(b"+++").await.is_err() {
            warn!(port = port.port_name(), "modem line gone before hangup");
            return;
        }
        tokio::time::sleep(self.pause).await;
        let _ = port.write_all(b"ATZ\r").await;
        tokio::time::sleep(self.pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::MediumType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn station() -> StationTarget {
        StationTarget::new("BIGRIVER", MediumType::PolledModem, "5551234", "h555")
    }

    /// Read from the device side until `needle` has been seen
    async fn expect(device: &mut DuplexStream, seen: &mut Vec<u8>, needle: &str) {
        let mut buf = [0u8; 256];
        while !String::from_utf8_lossy(seen).contains(needle) {
            let n = device.read(&mut buf).await.unwrap();
            assert!(n > 0, "line closed before {:?}", needle);
            seen.extend_from_slice(&buf[..n]);
        }
        seen.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_modem_gets_three_at_attempts() {
        let (mut device, host) = tokio::io::duplex(4096);
        let mut port = IoPort::from_stream(1, "farm:1", host);

        let err = ModemDialer::new()
            .connect(&mut port, &station())
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Dial { .. }));
        drop(port);

        let mut sent = Vec::new();
        device.read_to_end(&mut sent).await.unwrap();
        let text = String::from_utf8_lossy(&sent);
        assert_eq!(text.matches("AT\r").count(), 3);
        assert!(!text.contains("ATDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_connects() {
        let (mut device, host) = tokio::io::duplex(4096);
        let modem = tokio::spawn(async move {
            let mut seen = Vec::new();
            expect(&mut device, &mut seen, "AT\r").await;
            device.write_all(b"AT\r\r\nOK\r\n").await.unwrap();
            expect(&mut device, &mut seen, "ATDT5551234\r").await;
            device.write_all(b"\r\nCONNECT 9600\r\n").await.unwrap();
            device
        });

        let mut port = IoPort::from_stream(1, "farm:1", host);
        ModemDialer::new()
            .connect(&mut port, &station())
            .await
            .unwrap();

        // The line is handed back to the port for the protocol
        assert!(port.take_input().is_some());
        modem.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_is_early_dial_failure() {
        let (mut device, host) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            expect(&mut device, &mut seen, "AT\r").await;
            device.write_all(b"OK\r\n").await.unwrap();
            expect(&mut device, &mut seen, "ATDT").await;
            device.write_all(b"BUSY\r\n").await.unwrap();
            // Keep the line up past the dial
            tokio::time::sleep(Duration::from_secs(600)).await;
        });

        let mut port = IoPort::from_stream(1, "farm:1", host);
        let started = tokio::time::Instant::now();
        let err = ModemDialer::new()
            .connect(&mut port, &station())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("BUSY"));
        assert!(started.elapsed() < Duration::from_secs(MODEM_CONNECT_WAIT_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_sequence() {
        let (mut device, host) = tokio::io::duplex(4096);
        let mut port = IoPort::from_stream(1, "farm:1", host);
        ModemDialer::new().disconnect(&mut port).await;
        drop(port);

        let mut sent = Vec::new();
        device.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"+++ATZ\r");
    }
}
