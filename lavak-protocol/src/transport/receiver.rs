//! Inbound transfer state machine
//!
//! One task per accepted TLS connection. The protocol is strictly
//! ordered: `hello`, then `meta`, then the local accept/reject
//! decision, then `data` frames, then `done`. Anything out of order is
//! a protocol violation and destroys the connection.
//!
//! Decrypted plaintext is streamed straight to the destination file;
//! whole-file buffering never happens. After `done` the written file is
//! re-hashed and compared against the digest announced in `meta`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

use super::message::{encode_frame, read_frame, FrameReader, MessageHeader};
use crate::crypto;
use crate::transfer::{IncomingRequest, Transfer, TransferStatus, TransferTable};
use crate::{ProtocolError, Result};

/// Map of inbound transfers awaiting a user decision
pub(super) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>;

/// Drive one inbound connection to completion or failure
pub(super) async fn run_receiver(
    stream: SslStream<TcpStream>,
    peer_ip: IpAddr,
    table: Arc<TransferTable>,
    pending: PendingMap,
    downloads_dir: PathBuf,
) {
    let mut stream = stream;
    let mut transfer_id = None;

    let result = drive(
        &mut stream,
        peer_ip,
        &table,
        &pending,
        &downloads_dir,
        &mut transfer_id,
    )
    .await;

    if let Err(e) = result {
        match &transfer_id {
            Some(id) => {
                warn!("Inbound transfer {} failed: {}", id, e);
                pending.lock().await.remove(id);
                table.fail(id, TransferStatus::Error, e.to_string()).await;
            }
            None => warn!("Inbound connection from {} failed: {}", peer_ip, e),
        }
    }
    // Dropping the stream destroys the connection
}

async fn drive(
    stream: &mut SslStream<TcpStream>,
    peer_ip: IpAddr,
    table: &TransferTable,
    pending: &PendingMap,
    downloads_dir: &PathBuf,
    transfer_id_slot: &mut Option<String>,
) -> Result<()> {
    let mut reader = FrameReader::new();

    // 1. hello: peer public key and transfer id
    let frame = read_frame(stream, &mut reader)
        .await?
        .ok_or_else(|| violation("connection closed before hello"))?;
    if !frame.header.is_type("hello") {
        return Err(violation(&format!(
            "expected hello, got {}",
            frame.header.kind
        )));
    }
    let peer_public_key: String = frame.header.require_field("publicKey")?;
    let transfer_id: String = frame.header.require_field("transferId")?;
    *transfer_id_slot = Some(transfer_id.clone());
    debug!("Inbound transfer {} from {}", transfer_id, peer_ip);

    // 2. fresh session material, key wrapped for the peer
    let session = crypto::generate_session()?;
    let wrapped = crypto::wrap_session_key(&peer_public_key, &session.key)?;
    send(stream, MessageHeader::session(&wrapped, &session.iv)).await?;

    // 3. meta: create the pending transfer and ask the user
    let frame = read_frame(stream, &mut reader)
        .await?
        .ok_or_else(|| violation("connection closed before meta"))?;
    if !frame.header.is_type("meta") {
        return Err(violation(&format!(
            "expected meta, got {}",
            frame.header.kind
        )));
    }
    let raw_name: String = frame.header.require_field("name")?;
    let file_size: u64 = frame.header.require_field("size")?;
    let expected_hash: String = frame.header.require_field("hash")?;

    let file_name = sanitize_file_name(&raw_name);
    table
        .insert(Transfer::inbound(&transfer_id, &file_name, file_size, peer_ip))
        .await;

    let (decision_tx, decision_rx) = oneshot::channel();
    pending
        .lock()
        .await
        .insert(transfer_id.clone(), decision_tx);
    table.emit_incoming(IncomingRequest {
        transfer_id: transfer_id.clone(),
        file_name: file_name.clone(),
        file_size,
        peer_ip,
    });
    info!(
        "Incoming request {}: {} ({} bytes) from {}",
        transfer_id, file_name, file_size, peer_ip
    );

    // 4. wait for the decision; any protocol activity before it is an
    // error, and a dead connection unblocks us here too
    let accepted = tokio::select! {
        decision = decision_rx => decision.unwrap_or(false),
        frame = read_frame(stream, &mut reader) => {
            return Err(match frame? {
                Some(frame) => violation(&format!(
                    "{} received before transfer was accepted",
                    frame.header.kind
                )),
                None => violation("connection closed while awaiting decision"),
            });
        }
    };

    if !accepted {
        send(stream, MessageHeader::rejected(&transfer_id)).await?;
        table
            .fail(&transfer_id, TransferStatus::Rejected, "rejected by user")
            .await;
        return Ok(());
    }

    // 5. open the destination and start the stream
    tokio::fs::create_dir_all(downloads_dir).await?;
    let dest = downloads_dir.join(&file_name);
    let mut file = File::create(&dest).await?;
    table
        .update(&transfer_id, |t| {
            t.status = TransferStatus::Transferring;
            t.dest_path = Some(dest.clone());
        })
        .await;
    send(stream, MessageHeader::accepted(&transfer_id)).await?;

    let mut received: u64 = 0;
    loop {
        let frame = read_frame(stream, &mut reader)
            .await?
            .ok_or_else(|| violation("connection closed mid-transfer"))?;

        match frame.header.kind.as_str() {
            "data" => {
                let index: u32 = frame.header.require_field("index")?;
                let tag = frame.header.require_bytes_field("authTag")?;
                let chunk_size: usize = frame.header.require_field("chunkSize")?;
                if frame.payload.len() != chunk_size {
                    return Err(violation(&format!(
                        "data payload is {} bytes but chunkSize says {}",
                        frame.payload.len(),
                        chunk_size
                    )));
                }

                let iv = crypto::chunk_iv(&session.iv, index);
                let plaintext = crypto::open_chunk(&session.key, &iv, &frame.payload, &tag)?;

                if received + plaintext.len() as u64 > file_size {
                    return Err(violation("more data than announced in meta"));
                }
                file.write_all(&plaintext).await?;
                received += plaintext.len() as u64;
                table
                    .update(&transfer_id, |t| {
                        t.bytes_transferred = received;
                    })
                    .await;
            }
            "done" => break,
            other => return Err(violation(&format!("unexpected {} during transfer", other))),
        }
    }

    // 6. verify the written file against the announced digest
    file.flush().await?;
    drop(file);
    table
        .update(&transfer_id, |t| t.status = TransferStatus::Verifying)
        .await;

    let actual_hash = crypto::hash_file(&dest).await?;
    if !actual_hash.eq_ignore_ascii_case(&expected_hash) {
        debug!(
            "Digest mismatch on {}: expected {}, got {}",
            transfer_id, expected_hash, actual_hash
        );
        return Err(ProtocolError::HashMismatch);
    }

    info!("Inbound transfer {} completed and verified", transfer_id);
    table.complete(&transfer_id).await;
    Ok(())
}

async fn send(stream: &mut SslStream<TcpStream>, header: MessageHeader) -> Result<()> {
    let frame = encode_frame(&header, &[])?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

fn violation(message: &str) -> ProtocolError {
    ProtocolError::ProtocolViolation(message.to_string())
}

/// Reduce a sender-supplied name to a bare file name.
///
/// Directory components are discarded on both separator conventions, so
/// the written path always stays inside the downloads directory.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        "unnamed".to_string()
    } else {
        base.to_string()
    }
}
