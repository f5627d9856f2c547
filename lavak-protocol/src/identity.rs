//! Device identity and peer records
//!
//! A device identity lives for the process lifetime; the id is derived
//! from the hostname and process id, so restarting the process yields a
//! new identity. There is no persistent identity key.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Discriminator carried by every discovery datagram
pub const HELLO_TYPE: &str = "LAVAK_HELLO";

/// This device's identity, announced via discovery hellos
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    pub http_port: u16,
    pub transport_port: u16,
}

impl DeviceIdentity {
    /// Create an identity for this process.
    ///
    /// The id is `<hostname>-<pid>`, stable until the process exits.
    pub fn new(device_name: impl Into<String>, http_port: u16, transport_port: u16) -> Self {
        let host = local_hostname();
        Self {
            device_id: format!("{}-{}", host, std::process::id()),
            device_name: device_name.into(),
            platform: std::env::consts::OS.to_string(),
            http_port,
            transport_port,
        }
    }

    /// Build the hello datagram for this identity
    pub fn to_hello(&self) -> Hello {
        Hello {
            kind: HELLO_TYPE.to_string(),
            id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            http_port: self.http_port,
            transport_port: self.transport_port,
            platform: self.platform.clone(),
        }
    }
}

/// Best-effort local hostname, falling back to a fixed name
pub(crate) fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "la-vak".to_string())
}

/// One discovery datagram, as sent on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub device_name: String,
    pub http_port: u16,
    pub transport_port: u16,
    pub platform: String,
}

impl Hello {
    /// Parse a datagram payload. Returns `None` for anything that is not
    /// a well-formed hello; such datagrams are dropped silently.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let hello: Hello = serde_json::from_slice(data).ok()?;
        if hello.kind != HELLO_TYPE {
            return None;
        }
        Some(hello)
    }

    /// Turn a received hello into a peer record.
    ///
    /// The address always comes from the UDP envelope, never from the
    /// payload.
    pub fn into_peer(self, source_ip: IpAddr) -> Peer {
        Peer {
            id: self.id,
            device_name: self.device_name,
            ip: source_ip,
            http_port: self.http_port,
            transport_port: self.transport_port,
            platform: self.platform,
            last_seen: now_millis(),
        }
    }
}

/// A known remote device on the LAN
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub device_name: String,
    pub ip: IpAddr,
    pub http_port: u16,
    pub transport_port: u16,
    pub platform: String,
    /// UNIX milliseconds of the most recent hello
    pub last_seen: u64,
}

/// Current UNIX timestamp in milliseconds
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_has_process_scoped_id() {
        let identity = DeviceIdentity::new("Test Device", 8080, 45000);
        assert!(identity
            .device_id
            .ends_with(&format!("-{}", std::process::id())));
        assert_eq!(identity.device_name, "Test Device");
        assert_eq!(identity.transport_port, 45000);
    }

    #[test]
    fn test_hello_roundtrip() {
        let identity = DeviceIdentity::new("Test Device", 8080, 45000);
        let hello = identity.to_hello();

        let bytes = serde_json::to_vec(&hello).unwrap();
        let parsed = Hello::parse(&bytes).unwrap();

        assert_eq!(parsed.id, identity.device_id);
        assert_eq!(parsed.device_name, "Test Device");
        assert_eq!(parsed.transport_port, 45000);
    }

    #[test]
    fn test_hello_wire_field_names() {
        let hello = DeviceIdentity::new("Test Device", 8080, 45000).to_hello();
        let value = serde_json::to_value(&hello).unwrap();

        assert_eq!(value["type"], "LAVAK_HELLO");
        assert!(value.get("deviceName").is_some());
        assert!(value.get("httpPort").is_some());
        assert!(value.get("transportPort").is_some());
    }

    #[test]
    fn test_parse_drops_wrong_type() {
        let datagram = br#"{"type":"SOMETHING_ELSE","id":"a","deviceName":"b","httpPort":1,"transportPort":2,"platform":"linux"}"#;
        assert!(Hello::parse(datagram).is_none());
    }

    #[test]
    fn test_parse_drops_malformed_json() {
        assert!(Hello::parse(b"{not json").is_none());
        assert!(Hello::parse(b"").is_none());
    }

    #[test]
    fn test_into_peer_uses_envelope_ip() {
        let hello = DeviceIdentity::new("Test Device", 8080, 45000).to_hello();
        let source: IpAddr = "192.168.1.42".parse().unwrap();

        let peer = hello.into_peer(source);
        assert_eq!(peer.ip, source);
        assert!(peer.last_seen > 0);
    }
}
