//! Direct TCP dialer
//!
//! Medium id is `host[:port]`; the port defaults to telnet (23).

use super::Dialer;
use crate::constants::DEFAULT_TCP_STATION_PORT;
use crate::error::{PollError, Result};
use crate::port::IoPort;
use crate::station::StationTarget;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 (`[::1]:4001`)
pub fn split_host_port(medium_id: &str, default_port: u16) -> Result<(String, u16)> {
    let id = medium_id.trim();
    let bad = || PollError::config(format!("invalid TCP medium id '{}'", medium_id));

    if let Some(rest) = id.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad())?,
            None if tail.is_empty() => default_port,
            None => return Err(bad()),
        };
        return Ok((host.to_string(), port));
    }

    match id.rsplit_once(':') {
        // More than one colon without brackets: bare IPv6 address
        Some((host, _)) if host.contains(':') => Ok((id.to_string(), default_port)),
        Some((host, port)) if !host.is_empty() => {
            Ok((host.to_string(), port.parse().map_err(|_| bad())?))
        }
        Some(_) => Err(bad()),
        None if id.is_empty() => Err(bad()),
        None => Ok((id.to_string(), default_port)),
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, port: &mut IoPort, target: &StationTarget) -> Result<()> {
        let (host, tcp_port) = split_host_port(&target.medium_id, DEFAULT_TCP_STATION_PORT)?;
        let addr = format!("{}:{}", host, tcp_port);
        debug!(port = port.port_name(), "connecting to {}", addr);

        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(PollError::Dial {
                    target: addr,
                    reason: "connect failed".into(),
                    source: Some(e),
                })
            }
            Err(_) => {
                return Err(PollError::dial(
                    addr,
                    format!("no answer within {}s", self.timeout.as_secs()),
                ))
            }
        };

        let _ = stream.set_nodelay(true);
        port.set_peer(stream.peer_addr().ok());
        port.attach(stream);
        info!(station = %target.name, port = port.port_name(), "connected to {}", addr);
        Ok(())
    }

    async fn disconnect(&self, port: &mut IoPort) {
        if port.is_connected() {
            debug!(port = port.port_name(), "closing socket");
        }
        port.close_streams().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::NullDialer;
    use crate::station::MediumType;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn station(medium_id: &str) -> StationTarget {
        StationTarget::new("T", MediumType::PolledTcp, medium_id, "x")
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("10.0.0.5", 23).unwrap(), ("10.0.0.5".into(), 23));
        assert_eq!(
            split_host_port("logger.example:4001", 23).unwrap(),
            ("logger.example".into(), 4001)
        );
        assert_eq!(split_host_port("[::1]:4001", 23).unwrap(), ("::1".into(), 4001));
        assert_eq!(split_host_port("fe80::1", 23).unwrap(), ("fe80::1".into(), 23));
        assert!(split_host_port("host:notaport", 23).is_err());
        assert!(split_host_port("", 23).is_err());
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = Arc::new(TcpDialer::new(Duration::from_secs(5)));
        let mut port = IoPort::new(0, "tcp-0", dialer.clone());
        dialer
            .connect(&mut port, &station(&addr.to_string()))
            .await
            .unwrap();
        assert!(port.is_connected());
        assert_eq!(port.peer(), Some(addr));

        port.write_all(b"PING").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"PING");

        dialer.disconnect(&mut port).await;
        dialer.disconnect(&mut port).await;
        assert!(!port.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_is_dial_error() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let dialer = TcpDialer::new(Duration::from_secs(5));
        let mut port = IoPort::new(0, "tcp-0", Arc::new(NullDialer));
        let err = dialer
            .connect(&mut port, &station(&addr.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Dial { .. }));
    }
}
