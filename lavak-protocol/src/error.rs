//! Error handling for the La-Vak protocol
//!
//! A single error type covers all protocol operations. Errors from the
//! underlying libraries are converted automatically via `thiserror`.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or stream error
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Key generation, key wrapping, or certificate error
    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// Discovery could not bind its multicast socket. Fatal to Discovery.
    #[error("discovery bind failed: {0}")]
    DiscoveryBind(std::io::Error),

    /// Wrong message order or malformed content on a transport connection.
    /// Closes the connection and marks any active transfer as failed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// AES-GCM authentication tag mismatch on a received chunk.
    #[error("Decryption failed: possible tampering")]
    AuthFailure,

    /// Post-transfer digest of the written file disagrees with the
    /// digest announced by the sender.
    #[error("SHA-256 mismatch: file corrupted")]
    HashMismatch,

    /// The receiving peer declined the transfer.
    #[error("rejected by peer")]
    RejectedByPeer,

    /// Key material with the wrong length or encoding.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// A network operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::AuthFailure;
        assert!(error.to_string().contains("tampering"));

        let error = ProtocolError::HashMismatch;
        assert!(error.to_string().contains("SHA-256 mismatch"));

        let error = ProtocolError::RejectedByPeer;
        assert!(error.to_string().contains("rejected"));

        let error = ProtocolError::ProtocolViolation("data before accepted".to_string());
        assert_eq!(
            error.to_string(),
            "protocol violation: data before accepted"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "file not found");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Io(_)));
        assert!(protocol_error.to_string().contains("file not found"));
    }
}
