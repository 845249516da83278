//! Peer identity, metadata, and the per-peer lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A peer identity: the multihash of the node's Secp256k1 public key.
///
/// Rendered as base58 for display and wire transport. Ordering is
/// lexicographic on the raw multihash bytes, which is the comparison
/// the handshake tie-break uses.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_base58(s: &str) -> Option<Self> {
        bs58::decode(s).into_vec().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

/// Connection metadata for a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    pub id: PeerId,
    pub ip: String,
    pub port: u16,
    /// Configured for a permanent connection; disconnection schedules
    /// a reconnect job.
    pub designated: bool,
    /// Whether this node dials the peer (as opposed to having accepted it).
    pub outbound: bool,
}

impl PeerMeta {
    pub fn new(id: PeerId, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            ip: ip.into(),
            port,
            designated: false,
            outbound: false,
        }
    }

    /// Renders the listen address as a multiaddr: `/ip4/<ip>/tcp/<port>`.
    pub fn multiaddr(&self) -> String {
        format!("/ip4/{}/tcp/{}", self.ip, self.port)
    }

    /// Parses a designated-peer string of the form
    /// `/ip4/<ip>/tcp/<port>/p2p/<base58-id>`.
    pub fn from_multiaddr(addr: &str) -> Option<Self> {
        let parts: Vec<&str> = addr.split('/').collect();
        // leading slash yields an empty first element
        if parts.len() != 7 || parts[1] != "ip4" || parts[3] != "tcp" || parts[5] != "p2p" {
            return None;
        }
        let ip = parts[2].to_string();
        let port: u16 = parts[4].parse().ok()?;
        let id = PeerId::from_base58(parts[6])?;
        Some(Self {
            id,
            ip,
            port,
            designated: false,
            outbound: false,
        })
    }

    /// The TCP dial address, `ip:port`.
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Lifecycle of a remote peer. Only `Running` peers are eligible for
/// broadcast; notices sent to peers in any other state are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Connecting = 0,
    Handshaking = 1,
    Running = 2,
    Stopping = 3,
}

impl PeerState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Handshaking,
            2 => Self::Running,
            _ => Self::Stopping,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_base58_roundtrip() {
        let id = PeerId::from_bytes(vec![0x12, 0x20, 1, 2, 3, 4]);
        let encoded = id.to_base58();
        assert_eq!(PeerId::from_base58(&encoded), Some(id));
    }

    #[test]
    fn peer_id_ordering_is_byte_lexicographic() {
        let small = PeerId::from_bytes(vec![0x01]);
        let large = PeerId::from_bytes(vec![0x02]);
        assert!(small < large);
        assert!(small <= small.clone());
    }

    #[test]
    fn multiaddr_roundtrip() {
        let id = PeerId::from_bytes(vec![0x12, 0x20, 9, 9]);
        let meta = PeerMeta::new(id.clone(), "10.0.0.7", 7846);
        let addr = format!("{}/p2p/{}", meta.multiaddr(), id.to_base58());
        let parsed = PeerMeta::from_multiaddr(&addr).expect("parse");
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.ip, "10.0.0.7");
        assert_eq!(parsed.port, 7846);
    }

    #[test]
    fn malformed_multiaddr_is_rejected() {
        assert!(PeerMeta::from_multiaddr("/ip4/1.2.3.4/tcp/abc/p2p/xyz").is_none());
        assert!(PeerMeta::from_multiaddr("/ip6/::1/tcp/7846/p2p/xyz").is_none());
        assert!(PeerMeta::from_multiaddr("1.2.3.4:7846").is_none());
    }

    #[test]
    fn peer_state_from_u8_saturates_to_stopping() {
        assert_eq!(PeerState::from_u8(2), PeerState::Running);
        assert_eq!(PeerState::from_u8(9), PeerState::Stopping);
    }
}
