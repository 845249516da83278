//! Peer identity derivation.
//!
//! A peer is identified by the multihash of its compressed Secp256k1
//! public key: `0x12 0x20 ‖ SHA-256(pubkey)`, rendered as base58.

use sha2::{Digest, Sha256};

use skald_types::{PeerId, PublicKey};

/// Multihash code for SHA-256.
const MH_SHA2_256: u8 = 0x12;
/// Digest length of SHA-256.
const MH_LEN: u8 = 0x20;

/// Derive the peer id for a public key.
pub fn derive_peer_id(public_key: &PublicKey) -> PeerId {
    let digest: [u8; 32] = Sha256::digest(public_key.as_bytes()).into();
    let mut bytes = Vec::with_capacity(2 + 32);
    bytes.push(MH_SHA2_256);
    bytes.push(MH_LEN);
    bytes.extend_from_slice(&digest);
    PeerId::from_bytes(bytes)
}
