//! Listening pool: stations call in
//!
//! An accept task owns the listening socket and queues every accepted client.
//! Allocating a port pops the next queued client; the port already carries
//! the connection, so its dialer does nothing.

use super::{IoPort, PortPool, SessionState};
use crate::config::ListeningPoolSettings;
use crate::constants::CHANNEL_CAPACITY;
use crate::error::{PollError, Result};
use crate::protocol::expand::unescape;
use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Login challenge for inbound clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuth {
    None,
    /// Send `prompt`, expect `value` on the next line
    Password { prompt: Vec<u8>, value: String },
}

impl ClientAuth {
    /// Parse `none` or `password=<prompt>=<value>` (escapes allowed in the prompt)
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec.eq_ignore_ascii_case("none") {
            return Ok(Self::None);
        }
        let mut parts = spec.splitn(3, '=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(prompt), Some(value)) if kind.eq_ignore_ascii_case("password") => {
                Ok(Self::Password {
                    prompt: unescape(prompt),
                    value: value.to_string(),
                })
            }
            _ => Err(PollError::config(format!(
                "invalid authenticate_client '{}': expected none or password=<prompt>=<value>",
                spec
            ))),
        }
    }
}

type Accepted = (TcpStream, SocketAddr);

pub struct ListeningPool {
    local_addr: SocketAddr,
    max_sockets: usize,
    auth: ClientAuth,
    queue: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    allocated: Mutex<BTreeSet<u32>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ListeningPool {
    /// Bind the listening socket and start accepting
    pub fn bind(settings: &ListeningPoolSettings) -> Result<Self> {
        if settings.max_sockets == 0 {
            return Err(PollError::config("listening pool needs max_sockets > 0"));
        }
        let auth = ClientAuth::parse(&settings.authenticate_client)?;
        let listener = create_reusable_listener(settings.listening_port)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PollError::ListenBind {
                port: settings.listening_port,
                source: e,
            })?;

        let (tx, rx) = mpsc::channel::<Accepted>(CHANNEL_CAPACITY);
        let task = tokio::spawn(accept_loop(listener, tx));
        info!("listening for stations on {}", local_addr);

        Ok(Self {
            local_addr,
            max_sockets: settings.max_sockets,
            auth,
            queue: tokio::sync::Mutex::new(rx),
            allocated: Mutex::new(BTreeSet::new()),
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn auth(&self) -> &ClientAuth {
        &self.auth
    }

    /// Wait for the next client; `None` once the pool is closed
    pub async fn wait_for_client(&self) -> Option<IoPort> {
        let accepted = self.queue.lock().await.recv().await?;
        Some(self.lease(accepted))
    }

    fn lease(&self, (stream, addr): Accepted) -> IoPort {
        let mut allocated = self.allocated.lock();
        let num = (0u32..)
            .find(|n| !allocated.contains(n))
            .unwrap_or_default();
        allocated.insert(num);

        let _ = stream.set_nodelay(true);
        let mut port = IoPort::from_stream(num, format!("client-{}", num), stream);
        port.set_peer(Some(addr));
        port
    }
}

#[async_trait]
impl PortPool for ListeningPool {
    fn name(&self) -> &str {
        "listening"
    }

    async fn allocate_port(&self) -> Option<IoPort> {
        let accepted = self.queue.lock().await.try_recv().ok()?;
        Some(self.lease(accepted))
    }

    async fn release_port(&self, mut port: IoPort, final_state: SessionState, _was_connect_error: bool) {
        port.close_streams().await;
        self.allocated.lock().remove(&port.port_num());
        debug!(
            "released {} ({:?}, {})",
            port.port_name(),
            port.peer(),
            final_state
        );
    }

    fn num_ports(&self) -> usize {
        self.max_sockets
    }

    fn num_free_ports(&self) -> usize {
        self.max_sockets.saturating_sub(self.allocated.lock().len())
    }

    async fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        // Hang up clients that were accepted but never served
        let mut queue = self.queue.lock().await;
        queue.close();
        while let Ok((_, addr)) = queue.try_recv() {
            debug!("dropping queued client {}", addr);
        }
        self.allocated.lock().clear();
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Accepted>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("client connected from {}", addr);
                if tx.send((stream, addr)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// TCP listener with SO_REUSEADDR so a restarted poller can rebind at once
fn create_reusable_listener(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let map_err = |e| PollError::ListenBind { port, source: e };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(map_err)?;
    socket.set_reuse_address(true).map_err(map_err)?;
    socket.set_nonblocking(true).map_err(map_err)?;
    socket.bind(&addr.into()).map_err(map_err)?;
    socket.listen(128).map_err(map_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(map_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ListeningPoolSettings {
        ListeningPoolSettings {
            listening_port: 0,
            max_sockets: 2,
            authenticate_client: "none".into(),
        }
    }

    #[test]
    fn test_parse_auth() {
        assert_eq!(ClientAuth::parse("none").unwrap(), ClientAuth::None);
        assert_eq!(
            ClientAuth::parse("password=Password:\\r\\n=secret").unwrap(),
            ClientAuth::Password {
                prompt: b"Password:\r\n".to_vec(),
                value: "secret".into()
            }
        );
        assert!(ClientAuth::parse("token=abc").is_err());
    }

    #[tokio::test]
    async fn test_accepted_client_becomes_port() {
        let pool = ListeningPool::bind(&settings()).unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], pool.local_addr().port()));
        let _client = TcpStream::connect(addr).await.unwrap();

        let port = pool.wait_for_client().await.unwrap();
        assert!(port.is_connected());
        assert!(port.peer().is_some());
        assert_eq!(pool.num_free_ports(), 1);

        pool.release_port(port, SessionState::Success, false).await;
        assert_eq!(pool.num_free_ports(), 2);
        pool.close().await;
        assert!(pool.wait_for_client().await.is_none());
    }

    #[tokio::test]
    async fn test_allocate_without_client_is_none() {
        let pool = ListeningPool::bind(&settings()).unwrap();
        assert!(pool.allocate_port().await.is_none());
        pool.close().await;
    }
}
