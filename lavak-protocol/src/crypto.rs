//! Cryptographic primitives for La-Vak transfers
//!
//! Three concerns live here:
//!
//! 1. The process-wide RSA-4096 keypair used to wrap session keys during
//!    the transport handshake. Generated lazily on first use and cached
//!    for the lifetime of the process.
//! 2. Per-session AES-256-GCM material: a fresh 32-byte key and 12-byte
//!    base IV per transfer connection, with per-chunk IV derivation.
//! 3. Streaming SHA-256 file digests for post-transfer verification.
//!
//! ## Per-chunk IV derivation
//!
//! The IV for chunk `i` is the session base IV with its last 4 bytes
//! overwritten by `i` as a big-endian u32. The first 8 bytes stay random,
//! the chunk index supplies uniqueness, so GCM nonces never repeat under
//! one session key.

use std::path::Path;
use std::sync::OnceLock;

use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rand::rand_bytes;
use openssl::rsa::{Padding, Rsa};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::{ProtocolError, Result};

/// AES-256 session key length in bytes
pub const SESSION_KEY_LEN: usize = 32;

/// GCM base IV length in bytes
pub const BASE_IV_LEN: usize = 12;

/// GCM authentication tag length in bytes
pub const AUTH_TAG_LEN: usize = 16;

/// Modulus size of the process keypair
const RSA_BITS: u32 = 4096;

/// Read buffer size for streaming file digests
const DIGEST_BUF_LEN: usize = 64 * 1024;

/// The process-wide RSA keypair
pub struct ProcessKeys {
    public_pem: String,
    private_pem: String,
    private_key: PKey<Private>,
}

impl ProcessKeys {
    fn generate() -> Result<Self> {
        info!("Generating process RSA-{} keypair", RSA_BITS);

        let rsa = Rsa::generate(RSA_BITS)?;
        let key = PKey::from_rsa(rsa)?;

        let public_pem = String::from_utf8(key.public_key_to_pem()?)
            .map_err(|_| ProtocolError::InvalidKey("public key PEM is not UTF-8".to_string()))?;
        let private_pem = String::from_utf8(key.private_key_to_pem_pkcs8()?)
            .map_err(|_| ProtocolError::InvalidKey("private key PEM is not UTF-8".to_string()))?;

        Ok(Self {
            public_pem,
            private_pem,
            private_key: key,
        })
    }

    /// PEM encoding of the public half
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// PEM encoding of the private half
    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }
}

/// Get the process keypair, generating it on first call.
///
/// Generation blocks for a noticeable moment; callers are expected to
/// invoke this once during startup. Every later call returns the same
/// cached pair.
pub fn process_keys() -> Result<&'static ProcessKeys> {
    static KEYS: OnceLock<ProcessKeys> = OnceLock::new();

    if let Some(keys) = KEYS.get() {
        return Ok(keys);
    }

    // Two tasks racing here both generate, but only the first result is
    // stored and both observe the stored pair.
    let generated = ProcessKeys::generate()?;
    Ok(KEYS.get_or_init(|| generated))
}

/// Ephemeral keying material for one transfer connection
pub struct SessionSecret {
    pub key: [u8; SESSION_KEY_LEN],
    pub iv: [u8; BASE_IV_LEN],
}

/// Generate fresh session material from the OS CSPRNG
pub fn generate_session() -> Result<SessionSecret> {
    let mut key = [0u8; SESSION_KEY_LEN];
    let mut iv = [0u8; BASE_IV_LEN];
    rand_bytes(&mut key)?;
    rand_bytes(&mut iv)?;
    Ok(SessionSecret { key, iv })
}

/// Wrap a 32-byte session key with a peer's RSA public key (OAEP/SHA-256)
pub fn wrap_session_key(peer_public_pem: &str, key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != SESSION_KEY_LEN {
        return Err(ProtocolError::InvalidKey(format!(
            "session key must be {} bytes, got {}",
            SESSION_KEY_LEN,
            key.len()
        )));
    }

    let peer_key = PKey::public_key_from_pem(peer_public_pem.as_bytes())?;
    let mut encrypter = Encrypter::new(&peer_key)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
    encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;

    let mut wrapped = vec![0u8; encrypter.encrypt_len(key)?];
    let written = encrypter.encrypt(key, &mut wrapped)?;
    wrapped.truncate(written);
    Ok(wrapped)
}

/// Unwrap a session key with the process private key
pub fn unwrap_session_key(ciphertext: &[u8]) -> Result<[u8; SESSION_KEY_LEN]> {
    let keys = process_keys()?;

    let mut decrypter = Decrypter::new(&keys.private_key)?;
    decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    decrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
    decrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;

    let mut decrypted = vec![0u8; decrypter.decrypt_len(ciphertext)?];
    let written = decrypter.decrypt(ciphertext, &mut decrypted)?;
    decrypted.truncate(written);

    let key: [u8; SESSION_KEY_LEN] = decrypted.as_slice().try_into().map_err(|_| {
        ProtocolError::InvalidKey(format!(
            "unwrapped session key has {} bytes, expected {}",
            decrypted.len(),
            SESSION_KEY_LEN
        ))
    })?;
    Ok(key)
}

/// Derive the IV for chunk `index` from the session base IV
pub fn chunk_iv(base: &[u8; BASE_IV_LEN], index: u32) -> [u8; BASE_IV_LEN] {
    let mut iv = *base;
    iv[BASE_IV_LEN - 4..].copy_from_slice(&index.to_be_bytes());
    iv
}

/// Seal one chunk with AES-256-GCM. Returns `(ciphertext, tag)`.
pub fn seal_chunk(
    key: &[u8; SESSION_KEY_LEN],
    iv: &[u8; BASE_IV_LEN],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; AUTH_TAG_LEN])> {
    let mut tag = [0u8; AUTH_TAG_LEN];
    let ciphertext = encrypt_aead(
        Cipher::aes_256_gcm(),
        key,
        Some(iv),
        &[],
        plaintext,
        &mut tag,
    )?;
    Ok((ciphertext, tag))
}

/// Open one sealed chunk, verifying its authentication tag.
///
/// Any tampering of key, IV, ciphertext, or tag fails with
/// [`ProtocolError::AuthFailure`].
pub fn open_chunk(
    key: &[u8; SESSION_KEY_LEN],
    iv: &[u8; BASE_IV_LEN],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>> {
    decrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), &[], ciphertext, tag)
        .map_err(|_| ProtocolError::AuthFailure)
}

/// Compute the lowercase hex SHA-256 digest of a file by streaming reads
pub async fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = File::open(path.as_ref()).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BUF_LEN];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    let digest = hasher.finalize();
    Ok(digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>())
}
