//! Local serial pool
//!
//! Each configured device (`/dev/ttyUSB0`, `COM3`, ...) is one port. The
//! device is opened when the session connects, with the station's line
//! settings, and bridged into the async world:
//! - Reader thread: reads from the device, sends to a channel
//! - Writer thread: receives from a channel, writes to the device
//! - Pump task: moves bytes between the channels and an in-memory duplex
//!   whose other end is attached to the `IoPort`
//!
//! The bridge stops when the port is released (shutdown flag), the session
//! drops its streams, or the device disconnects.

use super::{IoPort, PortPool, SessionState};
use crate::config::SerialPoolSettings;
use crate::constants::{CHANNEL_CAPACITY, READ_BUFFER_SIZE, SERIAL_DISCONNECT_THRESHOLD};
use crate::dialer::{line_dialer, NullDialer};
use crate::error::{PollError, Result};
use crate::station::{Parity, StationTarget};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, StopBits};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Line settings resolved from a station (unset values: 9600 8N1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: serialport::Parity,
}

impl LineSettings {
    pub fn for_station(target: &StationTarget) -> Result<Self> {
        let bad = |what: String| {
            PollError::config(format!("station '{}': unsupported {}", target.name, what))
        };
        let data_bits = match target.data_bits {
            0 | 8 => DataBits::Eight,
            7 => DataBits::Seven,
            6 => DataBits::Six,
            5 => DataBits::Five,
            n => return Err(bad(format!("data bits {}", n))),
        };
        let stop_bits = match target.stop_bits {
            0 | 1 => StopBits::One,
            2 => StopBits::Two,
            n => return Err(bad(format!("stop bits {}", n))),
        };
        let parity = match target.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
            p => return Err(bad(format!("parity {}", p.as_str()))),
        };
        Ok(Self {
            baud: if target.baud == 0 { 9600 } else { target.baud },
            data_bits,
            stop_bits,
            parity,
        })
    }
}

pub struct SerialPool {
    devices: Vec<String>,
    /// Leased port numbers, with the bridge shutdown flag once opened
    leased: Mutex<HashMap<u32, Option<Arc<AtomicBool>>>>,
}

impl SerialPool {
    pub fn from_config(settings: &SerialPoolSettings) -> Result<Self> {
        if settings.devices.is_empty() {
            return Err(PollError::config("serial pool needs at least one device"));
        }
        Ok(Self::new(settings.devices.clone()))
    }

    pub fn new(devices: Vec<String>) -> Self {
        Self {
            devices,
            leased: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PortPool for SerialPool {
    fn name(&self) -> &str {
        "serial"
    }

    async fn allocate_port(&self) -> Option<IoPort> {
        let mut leased = self.leased.lock();
        let num = (0..self.devices.len() as u32).find(|n| !leased.contains_key(n))?;
        leased.insert(num, None);
        Some(IoPort::new(
            num,
            self.devices[num as usize].clone(),
            Arc::new(NullDialer),
        ))
    }

    async fn config_port(&self, port: &mut IoPort, target: &StationTarget) -> Result<()> {
        let line = LineSettings::for_station(target)?;
        let path = port.port_name().to_string();

        let open_path = path.clone();
        let device = tokio::task::spawn_blocking(move || {
            serialport::new(&open_path, line.baud)
                .data_bits(line.data_bits)
                .stop_bits(line.stop_bits)
                .parity(line.parity)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(100))
                .open()
        })
        .await
        .map_err(|e| PollError::dial(&path, format!("open task failed: {}", e)))?
        .map_err(|e| PollError::Dial {
            target: path.clone(),
            reason: "cannot open serial device".into(),
            source: Some(std::io::Error::other(e.to_string())),
        })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let near = spawn_bridge(device, &path, shutdown.clone())?;
        self.leased.lock().insert(port.port_num(), Some(shutdown));

        port.attach(near);
        port.set_dialer(line_dialer(target));
        debug!("{} open at {} baud", path, line.baud);
        Ok(())
    }

    async fn release_port(&self, mut port: IoPort, final_state: SessionState, _was_connect_error: bool) {
        port.close_streams().await;
        if let Some(Some(flag)) = self.leased.lock().remove(&port.port_num()) {
            flag.store(true, Ordering::SeqCst);
        }
        debug!("released {} ({})", port.port_name(), final_state);
    }

    fn num_ports(&self) -> usize {
        self.devices.len()
    }

    fn num_free_ports(&self) -> usize {
        self.devices.len() - self.leased.lock().len()
    }

    async fn close(&self) {
        for (num, flag) in self.leased.lock().drain() {
            warn!("{} still allocated at close", self.devices[num as usize]);
            if let Some(flag) = flag {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Bridge a blocking serial device to an async duplex; returns the port's end
fn spawn_bridge(
    device: Box<dyn serialport::SerialPort>,
    path: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<DuplexStream> {
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    let port_read = device;
    let port_write = port_read.try_clone().map_err(|e| PollError::Dial {
        target: path.to_string(),
        reason: "cannot clone serial handle".into(),
        source: Some(std::io::Error::other(e.to_string())),
    })?;

    // Reader thread (blocking)
    let shutdown_reader = shutdown.clone();
    std::thread::spawn(move || {
        let mut port = port_read;
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut consecutive_errors = 0u32;

        while !shutdown_reader.load(Ordering::Relaxed) {
            match port.read(&mut buf) {
                Ok(n) if n > 0 => {
                    consecutive_errors = 0;
                    if in_tx
                        .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {
                    consecutive_errors += 1;
                    if consecutive_errors > SERIAL_DISCONNECT_THRESHOLD {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    consecutive_errors = 0;
                }
                Err(_) => break,
            }
        }
    });

    // Writer thread (blocking)
    std::thread::spawn(move || {
        let mut port = port_write;
        while let Some(data) = out_rx.blocking_recv() {
            if shutdown.load(Ordering::Relaxed) || port.write_all(&data).is_err() {
                break;
            }
            let _ = port.flush();
        }
    });

    let (near, far) = tokio::io::duplex(READ_BUFFER_SIZE);
    tokio::spawn(pump(far, in_rx, out_tx));
    Ok(near)
}

/// Move bytes between the device channels and the far end of the duplex
async fn pump(far: DuplexStream, mut in_rx: mpsc::Receiver<Bytes>, out_tx: mpsc::Sender<Bytes>) {
    let (mut far_rd, mut far_wr) = tokio::io::split(far);
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            data = in_rx.recv() => match data {
                Some(data) => {
                    if far_wr.write_all(&data).await.is_err() {
                        break;
                    }
                }
                // Device gone: close the port's input
                None => break,
            },
            n = far_rd.read(&mut buf) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    let _ = far_wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::MediumType;

    fn station() -> StationTarget {
        StationTarget::new("S", MediumType::PolledModem, "5551234", "h555")
    }

    #[test]
    fn test_line_settings_defaults() {
        let line = LineSettings::for_station(&station()).unwrap();
        assert_eq!(line.baud, 9600);
        assert_eq!(line.data_bits, DataBits::Eight);
        assert_eq!(line.stop_bits, StopBits::One);
        assert_eq!(line.parity, serialport::Parity::None);
    }

    #[test]
    fn test_line_settings_rejects_mark_parity() {
        let mut s = station();
        s.parity = Parity::Mark;
        assert!(matches!(
            LineSettings::for_station(&s),
            Err(PollError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_devices_leased_exclusively() {
        let pool = SerialPool::new(vec!["/dev/ttyS0".into(), "/dev/ttyS1".into()]);
        let a = pool.allocate_port().await.unwrap();
        let b = pool.allocate_port().await.unwrap();
        assert_eq!(a.port_name(), "/dev/ttyS0");
        assert_eq!(b.port_name(), "/dev/ttyS1");
        assert!(pool.allocate_port().await.is_none());

        // Never-connected ports release cleanly
        pool.release_port(a, SessionState::Failed, true).await;
        assert_eq!(pool.num_free_ports(), 1);
        pool.close().await;
        assert_eq!(pool.num_free_ports(), 2);
    }

    #[test]
    fn test_empty_device_list_rejected() {
        assert!(SerialPool::from_config(&SerialPoolSettings::default()).is_err());
    }
}
