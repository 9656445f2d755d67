//! Remote serial settings for device-farm ports
//!
//! Before a farm port is used its serial line must match the station
//! (baud, data bits, stop bits, parity). The farm's control shell is reached
//! over telnet; one manager task owns that conversation and serves requests
//! in order, so two sessions never interleave commands on the shell.

use crate::constants::{CHANNEL_CAPACITY, FARM_CONTROL_PORT, FARM_PROMPT_WAIT_SECS, WAIT_FOR_CONFIG_SECS};
use crate::error::{PollError, Result};
use crate::reader::{PatternMatcher, StreamReader};
use crate::station::StationTarget;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Device preparation step used by the device-farm pool
#[async_trait]
pub trait PortConfigurator: Send + Sync {
    async fn configure(&self, port_num: u32, target: &StationTarget) -> Result<()>;
}

/// Control-shell command setting a port's line parameters
///
/// Unset line settings fall back to 9600 8N1.
pub fn serial_command(port_num: u32, target: &StationTarget) -> String {
    let or = |v: u32, d: u32| if v == 0 { d } else { v };
    format!(
        "set serial port={} baudrate={} databits={} stopbits={} parity={}",
        port_num,
        or(target.baud, 9600),
        or(target.data_bits as u32, 8),
        or(target.stop_bits as u32, 1),
        target.parity.as_str()
    )
}

/// Control-shell login and prompt
#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub host: String,
    pub control_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub prompt: String,
    pub prompt_wait: Duration,
}

impl ShellSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            control_port: FARM_CONTROL_PORT,
            username: None,
            password: None,
            prompt: "#>".to_string(),
            prompt_wait: Duration::from_secs(FARM_PROMPT_WAIT_SECS),
        }
    }
}

struct ConfigRequest {
    port_num: u32,
    command: String,
    reply: oneshot::Sender<Result<()>>,
}

/// Telnet configurator backed by a single manager task
pub struct TelnetConfigurator {
    tx: mpsc::Sender<ConfigRequest>,
    wait: Duration,
}

impl TelnetConfigurator {
    /// Start the manager task
    pub fn spawn(settings: ShellSettings) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_manager(settings, rx));
        Self {
            tx,
            wait: Duration::from_secs(WAIT_FOR_CONFIG_SECS),
        }
    }
}

#[async_trait]
impl PortConfigurator for TelnetConfigurator {
    async fn configure(&self, port_num: u32, target: &StationTarget) -> Result<()> {
        let (reply, done) = oneshot::channel();
        let request = ConfigRequest {
            port_num,
            command: serial_command(port_num, target),
            reply,
        };
        let device = format!("port {}", port_num);
        self.tx
            .send(request)
            .await
            .map_err(|_| PollError::dial(&device, "configuration manager stopped"))?;

        match tokio::time::timeout(self.wait, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PollError::dial(device, "configuration request dropped")),
            Err(_) => Err(PollError::dial(
                device,
                format!("not configured within {}s", self.wait.as_secs()),
            )),
        }
    }
}

async fn run_manager(settings: ShellSettings, mut rx: mpsc::Receiver<ConfigRequest>) {
    while let Some(req) = rx.recv().await {
        debug!("configuring farm port {}: {}", req.port_num, req.command);
        let result = run_command(&settings, &req.command).await;
        if let Err(ref e) = result {
            warn!("farm port {} configuration failed: {}", req.port_num, e);
        }
        // Requester may have given up already
        let _ = req.reply.send(result);
    }
    debug!("configuration manager stopped");
}

/// Log in to the control shell, run one command, wait for the prompt again
async fn run_command(settings: &ShellSettings, command: &str) -> Result<()> {
    let addr = format!("{}:{}", settings.host, settings.control_port);
    let stream = tokio::time::timeout(settings.prompt_wait, TcpStream::connect(&addr))
        .await
        .map_err(|_| PollError::dial(&addr, "control port did not answer"))?
        .map_err(|e| PollError::Dial {
            target: addr.clone(),
            reason: "control port connect failed".into(),
            source: Some(e),
        })?;
    let (rd, mut wr) = tokio::io::split(stream);
    let reader = StreamReader::spawn(Box::new(rd), addr.clone(), None);

    let result = async {
        if let Some(ref user) = settings.username {
            expect(&reader, settings, "login:", &addr).await?;
            send(&mut wr, user, &addr).await?;
            if let Some(ref pass) = settings.password {
                expect(&reader, settings, "assword:", &addr).await?;
                send(&mut wr, pass, &addr).await?;
            }
        }
        expect(&reader, settings, &settings.prompt, &addr).await?;
        send(&mut wr, command, &addr).await?;
        expect(&reader, settings, &settings.prompt, &addr).await
    }
    .await;

    let _ = wr.shutdown().await;
    reader.shutdown();
    result
}

async fn expect(reader: &StreamReader, settings: &ShellSettings, pattern: &str, addr: &str) -> Result<()> {
    let mut pats = [PatternMatcher::new(pattern)];
    if reader.wait(settings.prompt_wait, &mut pats).await {
        Ok(())
    } else {
        Err(PollError::dial(addr, format!("no '{}' from control shell", pattern)))
    }
}

async fn send<W: AsyncWrite + Unpin>(wr: &mut W, line: &str, addr: &str) -> Result<()> {
    wr.write_all(format!("{}\r", line).as_bytes())
        .await
        .map_err(|e| PollError::Dial {
            target: addr.to_string(),
            reason: "control shell write failed".into(),
            source: Some(e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{MediumType, Parity};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn station() -> StationTarget {
        let mut s = StationTarget::new("BIGRIVER", MediumType::PolledModem, "5551234", "h555");
        s.baud = 1200;
        s.data_bits = 7;
        s.parity = Parity::Even;
        s
    }

    #[test]
    fn test_serial_command() {
        assert_eq!(
            serial_command(4, &station()),
            "set serial port=4 baudrate=1200 databits=7 stopbits=1 parity=even"
        );
    }

    /// Minimal control shell: login, password, one command, records the command
    async fn fake_shell(listener: TcpListener) -> String {
        let (sock, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = tokio::io::split(sock);
        let mut rd = BufReader::new(rd);
        // Client lines end in \r only
        let mut line = Vec::new();

        wr.write_all(b"login: ").await.unwrap();
        rd.read_until(b'\r', &mut line).await.unwrap();
        wr.write_all(b"Password: ").await.unwrap();
        rd.read_until(b'\r', &mut line).await.unwrap();
        wr.write_all(b"\r\n#> ").await.unwrap();

        line.clear();
        rd.read_until(b'\r', &mut line).await.unwrap();
        wr.write_all(b"\r\n#> ").await.unwrap();
        String::from_utf8_lossy(&line).trim().to_string()
    }

    #[tokio::test]
    async fn test_configure_through_shell() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shell = tokio::spawn(fake_shell(listener));

        let mut settings = ShellSettings::new("127.0.0.1");
        settings.control_port = port;
        settings.username = Some("root".into());
        settings.password = Some("dbps".into());

        let cfg = TelnetConfigurator::spawn(settings);
        cfg.configure(4, &station()).await.unwrap();
        assert_eq!(
            shell.await.unwrap(),
            "set serial port=4 baudrate=1200 databits=7 stopbits=1 parity=even"
        );
    }
}
