//! The local node's network identity.
//!
//! The identity is injected at construction wherever it is needed;
//! there is deliberately no process-wide identity record.

use skald_crypto::derive_peer_id;
use skald_types::{KeyPair, PeerId, PublicKey};

/// Key pair plus the peer id derived from it.
pub struct NodeIdentity {
    pub peer_id: PeerId,
    pub key_pair: KeyPair,
}

impl NodeIdentity {
    pub fn new(key_pair: KeyPair) -> Self {
        let peer_id = derive_peer_id(&key_pair.public);
        Self { peer_id, key_pair }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.key_pair.public
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_crypto::generate_keypair;

    #[test]
    fn peer_id_matches_public_key() {
        let identity = NodeIdentity::new(generate_keypair());
        assert_eq!(identity.peer_id, derive_peer_id(identity.public_key()));
    }
}
