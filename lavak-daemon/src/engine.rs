//! Engine glue
//!
//! Starts the transport and discovery services, wires their event
//! streams together, and exposes the control surface a facade (HTTP,
//! WebSocket, CLI) would consume: send a file, answer an incoming
//! request, snapshot peers and transfers, subscribe to events. The
//! engine only holds what the subsystems hand out; the peer map and
//! the transfers map stay owned by their services.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use lavak_protocol::{
    DeviceIdentity, Discovery, DiscoveryConfig, DiscoveryEvent, Peer, Transfer, Transport,
    TransportConfig, TransportEvent,
};
use tracing::{info, warn};

use crate::config::Config;

pub struct Engine {
    identity: DeviceIdentity,
    transport: Transport,
    discovery: Discovery,
    auto_accept: bool,
}

impl Engine {
    /// Start transport and discovery per the daemon configuration
    pub async fn start(config: &Config) -> Result<Self> {
        let transport_config = TransportConfig {
            downloads_dir: config.transfers.downloads_dir.clone(),
            ..TransportConfig::default()
        };
        let mut transport = Transport::new(transport_config);
        let transport_port = transport
            .start()
            .await
            .context("Failed to start transport")?;

        let identity =
            DeviceIdentity::new(&config.device.name, config.device.http_port, transport_port);
        info!(
            "Running as {} ({}), transport on port {}",
            identity.device_name, identity.device_id, transport_port
        );

        let discovery_config = DiscoveryConfig {
            broadcast_interval: Duration::from_secs(config.network.broadcast_interval_secs),
            peer_timeout: Duration::from_secs(config.network.peer_timeout_secs),
            ..DiscoveryConfig::default()
        };
        let mut discovery = Discovery::new(identity.clone(), discovery_config);
        discovery
            .start()
            .await
            .context("Failed to start discovery")?;

        Ok(Self {
            identity,
            transport,
            discovery,
            auto_accept: config.transfers.auto_accept,
        })
    }

    /// This node's announced identity
    #[allow(dead_code)]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Begin a send; the transfer id keys later progress events
    /// (exercised by a facade, which the daemon runs without)
    #[allow(dead_code)]
    pub async fn send_file(
        &self,
        peer_ip: IpAddr,
        peer_port: u16,
        path: impl Into<PathBuf>,
        display_name: impl Into<String>,
    ) -> Result<String> {
        self.transport
            .send_file(peer_ip, peer_port, path, display_name)
            .await
            .context("Failed to start transfer")
    }

    /// Answer a pending incoming transfer
    pub async fn respond_to_incoming(&self, transfer_id: &str, accepted: bool) -> bool {
        self.transport.respond_to_incoming(transfer_id, accepted).await
    }

    /// Snapshot of all transfers
    #[allow(dead_code)]
    pub async fn transfers(&self) -> Vec<Transfer> {
        self.transport.transfers().await
    }

    /// Snapshot of the live peer list
    #[allow(dead_code)]
    pub async fn peers(&self) -> Vec<Peer> {
        self.discovery.peers().await
    }

    /// Route subsystem events until shutdown is requested.
    ///
    /// This is where a UI push channel would fan out; the daemon logs
    /// them and answers incoming requests per the auto-accept setting.
    pub async fn run(&mut self) -> Result<()> {
        let mut transport_events = self.transport.subscribe().await;
        let mut discovery_events = self.discovery.subscribe().await;

        loop {
            tokio::select! {
                event = transport_events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_transport_event(event).await;
                }
                event = discovery_events.recv() => {
                    let Some(event) = event else { break };
                    handle_discovery_event(event);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingRequest(req) => {
                info!(
                    "Incoming transfer {}: {} ({} bytes) from {}",
                    req.transfer_id, req.file_name, req.file_size, req.peer_ip
                );
                if self.auto_accept {
                    if !self.respond_to_incoming(&req.transfer_id, true).await {
                        warn!("Failed to auto-accept transfer {}", req.transfer_id);
                    }
                } else {
                    info!(
                        "Transfer {} awaiting decision; no facade is attached, rejecting",
                        req.transfer_id
                    );
                    self.respond_to_incoming(&req.transfer_id, false).await;
                }
            }
            TransportEvent::TransferProgress(t) => {
                info!(
                    "Transfer {} {:?}: {}/{} bytes",
                    t.id, t.status, t.bytes_transferred, t.file_size
                );
            }
            TransportEvent::TransferComplete(t) => {
                info!("Transfer {} completed: {}", t.id, t.file_name);
            }
            TransportEvent::TransferError(t) => {
                warn!(
                    "Transfer {} failed ({:?}): {}",
                    t.id,
                    t.status,
                    t.error.unwrap_or_default()
                );
            }
        }
    }

    async fn shutdown(&mut self) {
        self.discovery.stop().await;
        self.transport.stop().await;
    }
}

fn handle_discovery_event(event: DiscoveryEvent) {
    match event {
        DiscoveryEvent::ServiceStarted { port } => info!("Discovery running on port {}", port),
        DiscoveryEvent::ServiceStopped => info!("Discovery stopped"),
        DiscoveryEvent::PeerJoined(peer) => {
            info!("Peer joined: {} at {}", peer.device_name, peer.ip);
        }
        DiscoveryEvent::PeerLeft(peer) => {
            info!("Peer left: {}", peer.device_name);
        }
        DiscoveryEvent::PeersUpdated(peers) => {
            info!("{} peer(s) on the network", peers.len());
        }
    }
}
