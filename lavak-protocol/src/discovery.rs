//! LAN Peer Discovery
//!
//! Every node joins a well-known multicast group and periodically
//! announces itself with a small JSON hello datagram. Received hellos
//! maintain a live peer map; a periodic sweep evicts peers that have
//! gone quiet.
//!
//! Datagrams are independent: no sequence numbers, no acks. Anything
//! that fails to parse, or whose `type` field is not `LAVAK_HELLO`, is
//! dropped silently. The peer address is always taken from the UDP
//! source, never from the payload, and a node's own hellos are ignored.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::identity::{now_millis, DeviceIdentity, Hello, Peer};
use crate::{ProtocolError, Result};

/// Multicast group all La-Vak nodes join
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// UDP port for discovery datagrams
pub const DISCOVERY_PORT: u16 = 41234;

/// Interval between identity broadcasts
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(3);

/// A peer with no hello for longer than this is evicted
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// Multicast TTL for outgoing hellos
const MULTICAST_TTL: u32 = 128;

/// Configuration for the discovery service
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group to join
    pub group: Ipv4Addr,

    /// UDP port to bind and send to
    pub port: u16,

    /// How often to broadcast our identity
    pub broadcast_interval: Duration,

    /// How long before a silent peer is evicted
    pub peer_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: MULTICAST_GROUP,
            port: DISCOVERY_PORT,
            broadcast_interval: BROADCAST_INTERVAL,
            peer_timeout: PEER_TIMEOUT,
        }
    }
}

/// Events emitted by the discovery service
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// The service bound its socket and started broadcasting
    ServiceStarted { port: u16 },

    /// The service stopped and cleared its peer map
    ServiceStopped,

    /// A previously unknown peer sent a hello
    PeerJoined(Peer),

    /// A peer went silent past the timeout and was evicted
    PeerLeft(Peer),

    /// The peer set changed or refreshed; carries a full snapshot
    PeersUpdated(Vec<Peer>),
}

/// The peer map plus the upsert/evict rules that maintain it.
///
/// Kept separate from the socket plumbing so the table semantics are
/// testable without a network.
#[derive(Default)]
struct PeerTable {
    peers: HashMap<String, Peer>,
}

enum Observation {
    /// First hello from this peer
    Joined(Peer),
    /// Known peer refreshed its record
    Refreshed,
    /// Our own hello, ignored
    SelfHello,
}

impl PeerTable {
    /// Apply one received hello. The source address comes from the UDP
    /// envelope.
    fn observe(&mut self, own_id: &str, hello: Hello, source_ip: IpAddr) -> Observation {
        if hello.id == own_id {
            return Observation::SelfHello;
        }

        let peer = hello.into_peer(source_ip);
        let is_new = !self.peers.contains_key(&peer.id);
        self.peers.insert(peer.id.clone(), peer.clone());

        if is_new {
            Observation::Joined(peer)
        } else {
            Observation::Refreshed
        }
    }

    /// Remove every peer whose last hello is older than `timeout`,
    /// returning the evicted records.
    fn sweep(&mut self, timeout: Duration) -> Vec<Peer> {
        let deadline = now_millis().saturating_sub(timeout.as_millis() as u64);
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.last_seen < deadline)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .collect()
    }

    fn snapshot(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }
}

/// UDP-multicast discovery service
///
/// Runs three background tasks once started:
/// - Broadcaster: announces our identity every broadcast interval
/// - Listener: receives hellos and maintains the peer map
/// - Sweeper: evicts peers that have gone silent
pub struct Discovery {
    identity: DeviceIdentity,
    config: DiscoveryConfig,
    peers: Arc<RwLock<PeerTable>>,
    event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
    socket: Option<Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Discovery {
    /// Create a discovery service. The socket is bound by [`start`].
    ///
    /// [`start`]: Discovery::start
    pub fn new(identity: DeviceIdentity, config: DiscoveryConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            config,
            peers: Arc::new(RwLock::new(PeerTable::default())),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
            socket: None,
            tasks: Vec::new(),
        }
    }

    /// Create a discovery service with default configuration
    pub fn with_defaults(identity: DeviceIdentity) -> Self {
        Self::new(identity, DiscoveryConfig::default())
    }

    /// Get a receiver for discovery events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
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

    /// Bind the multicast socket and spawn the background tasks.
    ///
    /// A bind failure is fatal and propagated. A multicast-join failure
    /// is logged and skipped: multi-homed hosts may have unjoinable
    /// interfaces, and broadcasts still reach joined networks.
    pub async fn start(&mut self) -> Result<()> {
        let socket = bind_multicast(self.config.port).map_err(ProtocolError::DiscoveryBind)?;

        if let Err(e) = socket.join_multicast_v4(self.config.group, Ipv4Addr::UNSPECIFIED) {
            warn!("Failed to join multicast group {}: {}", self.config.group, e);
        }
        if let Err(e) = socket.set_multicast_ttl_v4(MULTICAST_TTL) {
            warn!("Failed to set multicast TTL: {}", e);
        }

        let socket = Arc::new(socket);
        info!(
            "Discovery started on {}:{} as {}",
            self.config.group, self.config.port, self.identity.device_id
        );

        let _ = self.event_tx.send(DiscoveryEvent::ServiceStarted {
            port: self.config.port,
        });

        self.tasks.push(self.spawn_broadcaster(socket.clone()));
        self.tasks.push(self.spawn_listener(socket.clone()));
        self.tasks.push(self.spawn_sweeper());
        self.socket = Some(socket);

        Ok(())
    }

    /// Stop the service: abort the tasks, leave the group, drop the
    /// socket, and clear the peer map.
    pub async fn stop(&mut self) {
        info!("Stopping discovery service");

        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(socket) = self.socket.take() {
            // Group membership also ends when the socket drops
            let _ = socket.leave_multicast_v4(self.config.group, Ipv4Addr::UNSPECIFIED);
        }

        self.peers.write().await.peers.clear();
        let _ = self.event_tx.send(DiscoveryEvent::ServiceStopped);
    }

    /// Snapshot of the current peer list
    pub async fn peers(&self) -> Vec<Peer> {
        self.peers.read().await.snapshot()
    }

    fn spawn_broadcaster(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let hello = self.identity.to_hello();
        let target = SocketAddr::new(IpAddr::V4(self.config.group), self.config.port);
        let period = self.config.broadcast_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let datagram = match serde_json::to_vec(&hello) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Failed to encode hello: {}", e);
                        continue;
                    }
                };
                // Send errors are per-datagram; the loop keeps going
                if let Err(e) = socket.send_to(&datagram, target).await {
                    warn!("Failed to send hello to {}: {}", target, e);
                }
            }
        })
    }

    fn spawn_listener(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let own_id = self.identity.device_id.clone();
        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (size, source) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Discovery receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let Some(hello) = Hello::parse(&buf[..size]) else {
                    debug!("Dropping non-hello datagram from {}", source);
                    continue;
                };

                let mut table = peers.write().await;
                match table.observe(&own_id, hello, source.ip()) {
                    Observation::Joined(peer) => {
                        info!(
                            "Peer joined: {} ({}) at {}",
                            peer.device_name, peer.id, peer.ip
                        );
                        let snapshot = table.snapshot();
                        drop(table);
                        let _ = event_tx.send(DiscoveryEvent::PeerJoined(peer));
                        let _ = event_tx.send(DiscoveryEvent::PeersUpdated(snapshot));
                    }
                    Observation::Refreshed => {
                        let snapshot = table.snapshot();
                        drop(table);
                        let _ = event_tx.send(DiscoveryEvent::PeersUpdated(snapshot));
                    }
                    Observation::SelfHello => {
                        debug!("Ignoring our own hello");
                    }
                }
            }
        })
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let timeout = self.config.peer_timeout;

        tokio::spawn(async move {
            let mut ticker = interval(timeout / 2);
            loop {
                ticker.tick().await;

                let mut table = peers.write().await;
                let evicted = table.sweep(timeout);
                if evicted.is_empty() {
                    continue;
                }
                let snapshot = table.snapshot();
                drop(table);

                for peer in evicted {
                    info!("Peer timed out: {} ({})", peer.device_name, peer.id);
                    let _ = event_tx.send(DiscoveryEvent::PeerLeft(peer));
                }
                let _ = event_tx.send(DiscoveryEvent::PeersUpdated(snapshot));
            }
        })
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Bind the shared discovery socket with address reuse enabled, so
/// several nodes on one host can listen on the same port.
fn bind_multicast(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;

    let socket = UdpSocket::from_std(std::net::UdpSocket::from(socket))?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_for(id: &str) -> Hello {
        Hello {
            kind: crate::identity::HELLO_TYPE.to_string(),
            id: id.to_string(),
            device_name: format!("device-{}", id),
            http_port: 8080,
            transport_port: 45000,
            platform: "linux".to_string(),
        }
    }

    fn source() -> IpAddr {
        "192.168.1.7".parse().unwrap()
    }

    #[test]
    fn test_table_join_then_refresh() {
        let mut table = PeerTable::default();

        let obs = table.observe("me", hello_for("peer-a"), source());
        assert!(matches!(obs, Observation::Joined(_)));
        assert_eq!(table.snapshot().len(), 1);

        let obs = table.observe("me", hello_for("peer-a"), source());
        assert!(matches!(obs, Observation::Refreshed));
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_table_self_suppression() {
        let mut table = PeerTable::default();

        for _ in 0..5 {
            let obs = table.observe("me", hello_for("me"), source());
            assert!(matches!(obs, Observation::SelfHello));
        }
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_table_sweep_evicts_stale_only() {
        let mut table = PeerTable::default();
        table.observe("me", hello_for("fresh"), source());
        table.observe("me", hello_for("stale"), source());

        // Backdate one entry past the timeout
        if let Some(peer) = table.peers.get_mut("stale") {
            peer.last_seen = now_millis() - 11_000;
        }

        let evicted = table.sweep(Duration::from_secs(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "stale");

        let remaining = table.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "fresh");
    }

    #[test]
    fn test_table_sweep_keeps_active_peers() {
        let mut table = PeerTable::default();
        table.observe("me", hello_for("peer-a"), source());

        assert!(table.sweep(Duration::from_secs(10)).is_empty());
        assert_eq!(table.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_with_defaults_uses_wire_constants() {
        let identity = DeviceIdentity::new("Test Node", 0, 45000);
        let discovery = Discovery::with_defaults(identity);

        assert_eq!(discovery.config.group, MULTICAST_GROUP);
        assert_eq!(discovery.config.port, DISCOVERY_PORT);
        assert_eq!(discovery.config.broadcast_interval, BROADCAST_INTERVAL);
        assert_eq!(discovery.config.peer_timeout, PEER_TIMEOUT);
        assert!(discovery.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let identity = DeviceIdentity::new("Test Node", 0, 45000);
        let config = DiscoveryConfig {
            // Off the well-known port so parallel test runs don't collide
            port: 41299,
            ..DiscoveryConfig::default()
        };
        let mut discovery = Discovery::new(identity, config);

        discovery.start().await.unwrap();
        assert!(discovery.peers().await.is_empty());

        discovery.stop().await;
        assert!(discovery.peers().await.is_empty());
    }
}
