//! Transfer records and transport events
//!
//! The transfer map is owned exclusively by the transport; everything
//! else sees snapshots. Every observable change flows through
//! [`TransferTable`], which is also the single emission site for
//! terminal events: a transfer emits exactly one of `TransferComplete`
//! or `TransferError` in its lifetime.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::identity::now_millis;

/// Direction of a transfer from this node's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Opening the TLS connection (send side)
    Connecting,
    /// Key exchange and metadata in flight
    Handshake,
    /// Awaiting the local user's accept/reject decision (receive side)
    Pending,
    /// Chunks are moving
    Transferring,
    /// Stream finished, digest being checked (receive side)
    Verifying,
    Completed,
    Rejected,
    Error,
}

impl TransferStatus {
    /// Terminal states never change again and emit no further events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Rejected | TransferStatus::Error
        )
    }
}

/// One transfer, sent or received
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub direction: TransferDirection,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// UNIX milliseconds at creation
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_path: Option<PathBuf>,
}

impl Transfer {
    /// New outbound transfer, about to connect
    pub fn outbound(
        id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        peer_ip: IpAddr,
    ) -> Self {
        Self {
            id: id.into(),
            direction: TransferDirection::Send,
            file_name: file_name.into(),
            file_size,
            bytes_transferred: 0,
            status: TransferStatus::Connecting,
            peer_ip: Some(peer_ip),
            error: None,
            started_at: now_millis(),
            dest_path: None,
        }
    }

    /// New inbound transfer, awaiting the user decision
    pub fn inbound(
        id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        peer_ip: IpAddr,
    ) -> Self {
        Self {
            id: id.into(),
            direction: TransferDirection::Receive,
            file_name: file_name.into(),
            file_size,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            peer_ip: Some(peer_ip),
            error: None,
            started_at: now_millis(),
            dest_path: None,
        }
    }
}

/// An inbound transfer waiting for the user's accept/reject decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRequest {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub peer_ip: IpAddr,
}

/// Events emitted by the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// State change or chunk movement on a transfer
    TransferProgress(Transfer),

    /// An inbound transfer is awaiting a decision; emitted exactly once
    /// per incoming transfer
    IncomingRequest(IncomingRequest),

    /// Terminal success; exactly one terminal event per transfer
    TransferComplete(Transfer),

    /// Terminal failure (`error` or `rejected`); mutually exclusive with
    /// `TransferComplete`
    TransferError(Transfer),
}

/// The transfers map plus its event fan-out.
///
/// All mutation goes through here; once a transfer reaches a terminal
/// status, further updates are ignored and no second terminal event can
/// be emitted.
pub(crate) struct TransferTable {
    transfers: RwLock<HashMap<String, Transfer>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransferTable {
    pub fn new(event_tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            transfers: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Register a new transfer and emit its first progress event
    pub async fn insert(&self, transfer: Transfer) {
        let mut transfers = self.transfers.write().await;
        transfers.insert(transfer.id.clone(), transfer.clone());
        drop(transfers);
        let _ = self
            .event_tx
            .send(TransportEvent::TransferProgress(transfer));
    }

    /// Apply a non-terminal update and emit progress. Updates on
    /// terminal or unknown transfers are dropped.
    pub async fn update(&self, id: &str, apply: impl FnOnce(&mut Transfer)) {
        let mut transfers = self.transfers.write().await;
        let Some(transfer) = transfers.get_mut(id) else {
            return;
        };
        if transfer.status.is_terminal() {
            debug!("Ignoring update on terminal transfer {}", id);
            return;
        }
        apply(transfer);
        let snapshot = transfer.clone();
        drop(transfers);
        let _ = self
            .event_tx
            .send(TransportEvent::TransferProgress(snapshot));
    }

    /// Announce an inbound transfer awaiting a decision
    pub fn emit_incoming(&self, request: IncomingRequest) {
        let _ = self.event_tx.send(TransportEvent::IncomingRequest(request));
    }

    /// Terminal success. A no-op if the transfer already terminated.
    pub async fn complete(&self, id: &str) {
        let mut transfers = self.transfers.write().await;
        let Some(transfer) = transfers.get_mut(id) else {
            return;
        };
        if transfer.status.is_terminal() {
            return;
        }
        transfer.status = TransferStatus::Completed;
        let snapshot = transfer.clone();
        drop(transfers);
        let _ = self
            .event_tx
            .send(TransportEvent::TransferComplete(snapshot));
    }

    /// Terminal failure with the given status (`Rejected` or `Error`).
    /// A no-op if the transfer already terminated.
    pub async fn fail(&self, id: &str, status: TransferStatus, message: impl Into<String>) {
        let mut transfers = self.transfers.write().await;
        let Some(transfer) = transfers.get_mut(id) else {
            return;
        };
        if transfer.status.is_terminal() {
            return;
        }
        transfer.status = status;
        transfer.error = Some(message.into());
        let snapshot = transfer.clone();
        drop(transfers);
        let _ = self.event_tx.send(TransportEvent::TransferError(snapshot));
    }

    pub async fn snapshot(&self) -> Vec<Transfer> {
        self.transfers.read().await.values().cloned().collect()
    }
}
