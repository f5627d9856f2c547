//! Outbound transfer state machine
//!
//! One task per send. The flow over a fresh TLS connection:
//!
//! 1. `hello` carrying our RSA public key and the transfer id
//! 2. wait for `session`, unwrap the AES key, remember the base IV
//! 3. `meta` with name, size, and the file's SHA-256
//! 4. wait for `accepted` (or `rejected`, which is terminal)
//! 5. stream the file as sealed 64 KiB chunks with strictly
//!    increasing indices, then `done`
//!
//! Chunk writes await the TLS stream, so a saturated connection
//! naturally pauses the file reader until the peer drains.

use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use openssl::ssl::Ssl;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

use super::message::{encode_frame, read_frame, Frame, FrameReader, MessageHeader};
use super::{tls, TransportConfig, CHUNK_SIZE};
use crate::crypto;
use crate::transfer::{TransferStatus, TransferTable};
use crate::{ProtocolError, Result};

/// Everything a sender task needs to run
pub(super) struct SendRequest {
    pub transfer_id: String,
    pub peer_ip: IpAddr,
    pub peer_port: u16,
    pub path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
}

/// Drive one outbound transfer to a terminal state
pub(super) async fn run_sender(table: Arc<TransferTable>, config: TransportConfig, req: SendRequest) {
    let transfer_id = req.transfer_id.clone();
    match drive(&table, &config, req).await {
        Ok(()) => {
            info!("Transfer {} completed", transfer_id);
            table.complete(&transfer_id).await;
        }
        Err(ProtocolError::RejectedByPeer) => {
            info!("Transfer {} rejected by peer", transfer_id);
            table
                .fail(&transfer_id, TransferStatus::Rejected, "rejected by peer")
                .await;
        }
        Err(e) => {
            warn!("Transfer {} failed: {}", transfer_id, e);
            table
                .fail(&transfer_id, TransferStatus::Error, e.to_string())
                .await;
        }
    }
}

async fn drive(table: &TransferTable, config: &TransportConfig, req: SendRequest) -> Result<()> {
    // The digest goes into `meta`, so it is computed up front while the
    // transfer is still in `connecting`.
    let hash = crypto::hash_file(&req.path).await?;
    let keys = crypto::process_keys()?;

    let mut stream = connect(req.peer_ip, req.peer_port, config).await?;
    debug!(
        "TLS connection established to {}:{}",
        req.peer_ip, req.peer_port
    );

    send(&mut stream, MessageHeader::hello(keys.public_pem(), &req.transfer_id)).await?;
    table
        .update(&req.transfer_id, |t| t.status = TransferStatus::Handshake)
        .await;

    let mut reader = FrameReader::new();

    let frame = expect_frame(&mut stream, &mut reader, "session").await?;
    let wrapped = frame.header.require_bytes_field("encryptedKey")?;
    let iv_bytes = frame.header.require_bytes_field("iv")?;
    let base_iv: [u8; crypto::BASE_IV_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
        ProtocolError::ProtocolViolation(format!(
            "session iv has {} bytes, expected {}",
            iv_bytes.len(),
            crypto::BASE_IV_LEN
        ))
    })?;
    let key = crypto::unwrap_session_key(&wrapped)?;

    send(
        &mut stream,
        MessageHeader::meta(&req.file_name, req.file_size, &hash, &req.transfer_id),
    )
    .await?;

    let frame = read_frame(&mut stream, &mut reader)
        .await?
        .ok_or_else(closed_during_handshake)?;
    match frame.header.kind.as_str() {
        "accepted" => {}
        "rejected" => return Err(ProtocolError::RejectedByPeer),
        other => {
            return Err(ProtocolError::ProtocolViolation(format!(
                "expected accepted or rejected, got {}",
                other
            )))
        }
    }

    table
        .update(&req.transfer_id, |t| t.status = TransferStatus::Transferring)
        .await;

    stream_chunks(table, &req, &mut stream, &key, &base_iv).await?;

    send(&mut stream, MessageHeader::done()).await?;
    stream.flush().await?;
    // Give TLS a chance to deliver close_notify; failures past this
    // point no longer matter to the transfer.
    let _ = stream.shutdown().await;

    Ok(())
}

async fn stream_chunks(
    table: &TransferTable,
    req: &SendRequest,
    stream: &mut SslStream<TcpStream>,
    key: &[u8; crypto::SESSION_KEY_LEN],
    base_iv: &[u8; crypto::BASE_IV_LEN],
) -> Result<()> {
    let mut file = File::open(&req.path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut index: u32 = 0;

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }

        let iv = crypto::chunk_iv(base_iv, index);
        let (ciphertext, tag) = crypto::seal_chunk(key, &iv, &buf[..read])?;
        let frame = encode_frame(&MessageHeader::data(index, &tag, ciphertext.len()), &ciphertext)?;
        stream.write_all(&frame).await?;

        index = index.checked_add(1).ok_or_else(|| {
            ProtocolError::ProtocolViolation("chunk index exhausted for this session".to_string())
        })?;

        table
            .update(&req.transfer_id, |t| {
                t.bytes_transferred += read as u64;
            })
            .await;
    }

    Ok(())
}

async fn connect(
    peer_ip: IpAddr,
    peer_port: u16,
    config: &TransportConfig,
) -> Result<SslStream<TcpStream>> {
    let tcp = timeout(
        config.connect_timeout,
        TcpStream::connect((peer_ip, peer_port)),
    )
    .await
    .map_err(|_| ProtocolError::Timeout(format!("connecting to {}:{}", peer_ip, peer_port)))??;

    let connector = tls::client_connector()?;
    let ssl = Ssl::new(connector.context())?;
    let mut stream = SslStream::new(ssl, tcp)?;

    timeout(config.connect_timeout, Pin::new(&mut stream).connect())
        .await
        .map_err(|_| ProtocolError::Timeout(format!("TLS handshake with {}:{}", peer_ip, peer_port)))??;

    Ok(stream)
}

async fn send(stream: &mut SslStream<TcpStream>, header: MessageHeader) -> Result<()> {
    let frame = encode_frame(&header, &[])?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn expect_frame(
    stream: &mut SslStream<TcpStream>,
    reader: &mut FrameReader,
    kind: &str,
) -> Result<Frame> {
    let frame = read_frame(stream, reader)
        .await?
        .ok_or_else(closed_during_handshake)?;
    if !frame.header.is_type(kind) {
        return Err(ProtocolError::ProtocolViolation(format!(
            "expected {}, got {}",
            kind, frame.header.kind
        )));
    }
    Ok(frame)
}

fn closed_during_handshake() -> ProtocolError {
    ProtocolError::ProtocolViolation("connection closed during handshake".to_string())
}
