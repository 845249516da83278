//! Secp256k1 ECDSA message signing and verification over SHA-256.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use skald_types::{Block, KeyPair, PrivateKey, PublicKey, Signature};

/// Compute a SHA-256 digest of arbitrary data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Sign a message with a private key, returning the fixed-size signature.
///
/// The message is hashed with SHA-256 as part of the ECDSA scheme.
pub fn sign_message(message: &[u8], private_key: &PrivateKey) -> Signature {
    let signing_key =
        SigningKey::from_slice(&private_key.0).expect("private key bytes are a valid scalar");
    let sig: EcdsaSignature = signing_key.sign(message);
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&sig.to_bytes());
    Signature(bytes)
}

/// Verify a signature against a message and public key.
///
/// Returns `true` if the signature is valid, `false` otherwise
/// (including malformed keys or signatures).
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&public_key.0) else {
        return false;
    };
    let Ok(sig) = EcdsaSignature::from_slice(&signature.0) else {
        return false;
    };
    verifying_key.verify(message, &sig).is_ok()
}

/// Attach the producer's public key and header signature to a block.
pub fn sign_block(block: &mut Block, key_pair: &KeyPair) {
    block.header.pub_key = Some(key_pair.public.clone());
    let sig = sign_message(&block.header.signable_bytes(), &key_pair.private);
    block.header.sign = Some(sig);
}

/// Verify a block's producer signature. Unsigned blocks fail.
pub fn verify_block_sign(block: &Block) -> bool {
    let (Some(pub_key), Some(sign)) = (&block.header.pub_key, &block.header.sign) else {
        return false;
    };
    verify_signature(&block.header.signable_bytes(), sign, pub_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;

    #[test]
    fn sign_and_verify() {
        let kp = generate_keypair();
        let msg = b"test message for the skald wire protocol";
        let sig = sign_message(msg, &kp.private);
        assert!(verify_signature(msg, &sig, &kp.public));
    }

    #[test]
    fn wrong_message_fails() {
        let kp = generate_keypair();
        let sig = sign_message(b"correct message", &kp.private);
        assert!(!verify_signature(b"wrong message", &sig, &kp.public));
    }

    #[test]
    fn wrong_key_fails() {
        let kp1 = generate_keypair();
        let kp2 = generate_keypair();
        let sig = sign_message(b"test", &kp1.private);
        assert!(!verify_signature(b"test", &sig, &kp2.public));
    }

    #[test]
    fn garbage_public_key_fails_closed() {
        let kp = generate_keypair();
        let sig = sign_message(b"test", &kp.private);
        let bogus = PublicKey([0xFF; 33]);
        assert!(!verify_signature(b"test", &sig, &bogus));
    }

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256(b"abc"), sha256(b"abc"));
        assert_ne!(sha256(b"abc"), sha256(b"abd"));
    }

    #[test]
    fn signed_block_verifies() {
        let kp = generate_keypair();
        let mut block = Block::genesis(1_700_000_000);
        assert!(!verify_block_sign(&block));

        sign_block(&mut block, &kp);
        assert!(verify_block_sign(&block));
    }

    #[test]
    fn tampered_block_fails_verification() {
        let kp = generate_keypair();
        let mut block = Block::genesis(1_700_000_000);
        sign_block(&mut block, &kp);

        block.header.timestamp += 1;
        assert!(!verify_block_sign(&block));
    }
}
