//! TLS configuration for the transport
//!
//! Each transport instance generates an ephemeral self-signed server
//! identity at startup: a fresh RSA keypair and a certificate valid for
//! 24 hours whose subject is the local hostname. Certificate
//! verification is disabled on both sides of every connection. This is
//! deliberate: the threat model is a trusted LAN, and the end-to-end
//! security properties come from the RSA/AES handshake plus the
//! post-transfer SHA-256 check. TLS only shields the stream from
//! passive sniffers.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use tracing::debug;

use crate::identity::local_hostname;
use crate::Result;

/// Certificate lifetime in days
const CERT_VALIDITY_DAYS: u32 = 1;

/// Key size for the throwaway TLS identity
const TLS_RSA_BITS: u32 = 2048;

/// Organization name in the certificate subject
const CERT_ORG: &str = "La-Vak";

/// Ephemeral TLS server identity for one transport instance
pub struct TlsIdentity {
    certificate: X509,
    private_key: PKey<Private>,
}

impl TlsIdentity {
    /// Generate a self-signed certificate for the local hostname,
    /// valid for 24 hours.
    pub fn generate() -> Result<Self> {
        let subject = local_hostname();
        debug!("Generating ephemeral TLS identity for {}", subject);

        let rsa = Rsa::generate(TLS_RSA_BITS)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("CN", &subject)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;

        Ok(Self {
            certificate: builder.build(),
            private_key: pkey,
        })
    }
}

/// Build the acceptor for the transport's TLS listener.
///
/// Client certificates are neither requested nor verified.
pub fn server_acceptor(identity: &TlsIdentity) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_certificate(&identity.certificate)?;
    builder.set_private_key(&identity.private_key)?;
    Ok(builder.build())
}

/// Build the connector for outbound transfer connections.
///
/// The server certificate is not verified; see the module docs.
pub fn client_connector() -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let identity = TlsIdentity::generate().unwrap();

        let subject = identity.certificate.subject_name();
        let cn = subject
            .entries()
            .find(|e| e.object().nid() == openssl::nid::Nid::COMMONNAME)
            .expect("certificate should carry a CN");
        assert_eq!(cn.data().as_utf8().unwrap().to_string(), local_hostname());
    }

    #[test]
    fn test_acceptor_and_connector_build() {
        let identity = TlsIdentity::generate().unwrap();
        assert!(server_acceptor(&identity).is_ok());
        assert!(client_connector().is_ok());
    }
}
