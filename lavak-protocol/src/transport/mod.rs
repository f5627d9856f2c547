//! Secure file transport
//!
//! Owns the TLS listener, every connection task, and the transfers map.
//! Each outbound send opens its own TLS connection and runs the sender
//! state machine; each accepted connection runs the receiver state
//! machine. The two sides meet only on the wire.
//!
//! See [`message`] for the frame format and [`sender`]/[`receiver`] for
//! the two state machines.

pub mod message;
pub mod tls;

mod receiver;
mod sender;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use openssl::ssl::Ssl;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_openssl::SslStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::transfer::{Transfer, TransferTable, TransportEvent};
use crate::{ProtocolError, Result};

use receiver::PendingMap;
use sender::SendRequest;

/// File read/seal granularity for streaming
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default deadline for outbound TCP connect and TLS handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to bind the TLS listener to; port 0 asks the OS
    pub listen_addr: SocketAddr,

    /// Where accepted files are written
    pub downloads_dir: PathBuf,

    /// Deadline for outbound connect and handshake
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let downloads_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Downloads")
            .join("la-vak");

        Self {
            listen_addr: "0.0.0.0:0".parse().unwrap(),
            downloads_dir,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Secure transport service: TLS listener plus per-transfer tasks
pub struct Transport {
    config: TransportConfig,
    table: Arc<TransferTable>,
    pending: PendingMap,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<TransportEvent>>>,
    server_task: Option<JoinHandle<()>>,
    local_port: Option<u16>,
}

impl Transport {
    /// Create a transport. The listener is bound by [`start`].
    ///
    /// [`start`]: Transport::start
    pub fn new(config: TransportConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            table: Arc::new(TransferTable::new(event_tx)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            event_rx: Arc::new(RwLock::new(event_rx)),
            server_task: None,
            local_port: None,
        }
    }

    /// Create a transport with default configuration
    pub fn with_defaults() -> Self {
        Self::new(TransportConfig::default())
    }

    /// Get a receiver for transport events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let event_rx = self.event_rx.clone();
        tokio::spawn(async move {
            let mut rx_lock = event_rx.write().await;
            while let Some(event) = rx_lock.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// Generate the ephemeral TLS identity, bind the listener, and start
    /// accepting connections. Returns the bound port.
    pub async fn start(&mut self) -> Result<u16> {
        tokio::fs::create_dir_all(&self.config.downloads_dir).await?;

        let identity = tls::TlsIdentity::generate()?;
        let acceptor = Arc::new(tls::server_acceptor(&identity)?);

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let port = listener.local_addr()?.port();
        info!("Transport listening on port {}", port);

        let table = self.table.clone();
        let pending = self.pending.clone();
        let downloads_dir = self.config.downloads_dir.clone();

        let server_task = tokio::spawn(async move {
            loop {
                let (tcp, remote_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                };
                debug!("Accepted connection from {}", remote_addr);

                let acceptor = acceptor.clone();
                let table = table.clone();
                let pending = pending.clone();
                let downloads_dir = downloads_dir.clone();

                tokio::spawn(async move {
                    let stream = match tls_accept(&acceptor, tcp).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", remote_addr, e);
                            return;
                        }
                    };
                    receiver::run_receiver(stream, remote_addr.ip(), table, pending, downloads_dir)
                        .await;
                });
            }
        });

        self.server_task = Some(server_task);
        self.local_port = Some(port);
        Ok(port)
    }

    /// Stop accepting connections. Running transfers are left to finish.
    pub async fn stop(&mut self) {
        info!("Stopping transport");
        if let Some(task) = self.server_task.take() {
            task.abort();
        }
        self.local_port = None;
    }

    /// The port the listener is bound to, once started
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Begin sending a file to a peer. Returns the transfer id; progress
    /// and the terminal outcome arrive as events.
    pub async fn send_file(
        &self,
        peer_ip: IpAddr,
        peer_port: u16,
        path: impl Into<PathBuf>,
        display_name: impl Into<String>,
    ) -> Result<String> {
        let path = path.into();
        let file_name = display_name.into();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        let file_size = metadata.len();

        let transfer_id = Uuid::new_v4().to_string();
        info!(
            "Sending {} ({} bytes) to {}:{} as transfer {}",
            file_name, file_size, peer_ip, peer_port, transfer_id
        );

        self.table
            .insert(Transfer::outbound(&transfer_id, &file_name, file_size, peer_ip))
            .await;

        let request = SendRequest {
            transfer_id: transfer_id.clone(),
            peer_ip,
            peer_port,
            path,
            file_name,
            file_size,
        };
        tokio::spawn(sender::run_sender(
            self.table.clone(),
            self.config.clone(),
            request,
        ));

        Ok(transfer_id)
    }

    /// Answer a pending incoming transfer. Returns false if the transfer
    /// is unknown or was already answered.
    pub async fn respond_to_incoming(&self, transfer_id: &str, accepted: bool) -> bool {
        let Some(decision_tx) = self.pending.lock().await.remove(transfer_id) else {
            debug!("No pending incoming transfer {}", transfer_id);
            return false;
        };
        decision_tx.send(accepted).is_ok()
    }

    /// Snapshot of all transfers this transport has seen
    pub async fn transfers(&self) -> Vec<Transfer> {
        self.table.snapshot().await
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.server_task.take() {
            task.abort();
        }
    }
}

async fn tls_accept(
    acceptor: &openssl::ssl::SslAcceptor,
    tcp: tokio::net::TcpStream,
) -> Result<SslStream<tokio::net::TcpStream>> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream).accept().await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_paths() {
        let config = TransportConfig::default();
        assert!(config.downloads_dir.ends_with("Downloads/la-vak"));
        assert_eq!(config.listen_addr.port(), 0);
    }

    #[tokio::test]
    async fn test_start_returns_os_chosen_port() {
        let mut config = TransportConfig::default();
        let temp = tempfile::tempdir().unwrap();
        config.downloads_dir = temp.path().to_path_buf();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();

        let mut transport = Transport::new(config);
        let port = transport.start().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(transport.local_port(), Some(port));

        transport.stop().await;
        assert_eq!(transport.local_port(), None);
    }

    #[tokio::test]
    async fn test_respond_to_unknown_transfer_is_false() {
        let transport = Transport::with_defaults();
        assert!(!transport.respond_to_incoming("no-such-id", true).await);
    }

    #[tokio::test]
    async fn test_send_file_missing_path_fails_fast() {
        let transport = Transport::with_defaults();
        let result = transport
            .send_file(
                "127.0.0.1".parse().unwrap(),
                1,
                "/definitely/not/a/file",
                "x",
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }
}
