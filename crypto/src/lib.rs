//! Secp256k1 cryptography for skald: message signing, key management,
//! and peer-id derivation.

pub mod keys;
pub mod peer_id;
pub mod sign;

pub use keys::{generate_keypair, keypair_from_private, load_or_generate_keypair};
pub use peer_id::derive_peer_id;
pub use sign::{sha256, sign_block, sign_message, verify_block_sign, verify_signature};
