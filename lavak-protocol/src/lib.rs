//! La-Vak Protocol Implementation
//!
//! This library provides the core of La-Vak, a zero-configuration
//! peer-to-peer file transfer system for a single local network:
//!
//! - **Discovery**: UDP-multicast hello protocol that maintains a live set
//!   of reachable peers with timeout-based eviction.
//! - **Transport**: framed, end-to-end-encrypted file streaming over TLS
//!   with an RSA/AES hybrid handshake, per-chunk AES-256-GCM, receiver-side
//!   accept/reject control, and post-transfer SHA-256 verification.
//! - **Crypto**: the RSA-4096 keypair lifecycle, session key wrapping, and
//!   chunk sealing primitives the transport is built on.

pub mod crypto;
pub mod discovery;
pub mod identity;
pub mod transfer;
pub mod transport;

mod error;

pub use discovery::{Discovery, DiscoveryConfig, DiscoveryEvent};
pub use error::{ProtocolError, Result};
pub use identity::{DeviceIdentity, Peer};
pub use transfer::{
    IncomingRequest, Transfer, TransferDirection, TransferStatus, TransportEvent,
};
pub use transport::{Transport, TransportConfig};
