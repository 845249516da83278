//! Cryptographic key types for node identity and block signing.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 33-byte compressed Secp256k1 public key (SEC1 encoding).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 33]);

/// A 32-byte Secp256k1 private key (secret scalar).
///
/// This type intentionally does not implement `Debug`, `Serialize`, or
/// `Clone` to prevent accidental exposure. Key bytes are zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(pub [u8; 32]);

/// A 64-byte Secp256k1 ECDSA signature (fixed r ‖ s encoding).
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

/// A Secp256k1 key pair (public + private).
///
/// Use `skald_crypto::generate_keypair()` or
/// `skald_crypto::keypair_from_private()` to construct key pairs.
/// This struct is intentionally just data.
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

// Serde does not derive for arrays past 32 elements, so PublicKey and
// Signature carry hand-written byte-oriented impls.

macro_rules! bytes_serde {
    ($type:ident, $len:expr) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct BytesVisitor;

                impl<'de> serde::de::Visitor<'de> for BytesVisitor {
                    type Value = $type;

                    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                        write!(f, "{} bytes", $len)
                    }

                    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                        let arr: [u8; $len] = v
                            .try_into()
                            .map_err(|_| E::invalid_length(v.len(), &self))?;
                        Ok($type(arr))
                    }

                    fn visit_seq<A: serde::de::SeqAccess<'de>>(
                        self,
                        mut seq: A,
                    ) -> Result<Self::Value, A::Error> {
                        let mut arr = [0u8; $len];
                        for (i, byte) in arr.iter_mut().enumerate() {
                            *byte = seq
                                .next_element()?
                                .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                        }
                        Ok($type(arr))
                    }
                }

                deserializer.deserialize_bytes(BytesVisitor)
            }
        }
    };
}

bytes_serde!(PublicKey, 33);
bytes_serde!(Signature, 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrips_through_bincode() {
        let sig = Signature([0xAB; 64]);
        let bytes = bincode::serialize(&sig).unwrap();
        let decoded: Signature = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, sig);
    }

    #[test]
    fn public_key_roundtrips_through_bincode() {
        let mut raw = [0u8; 33];
        raw[0] = 0x02;
        raw[1] = 0x77;
        let pk = PublicKey(raw);
        let bytes = bincode::serialize(&pk).unwrap();
        let decoded: PublicKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, pk);
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let sig = Signature([1u8; 64]);
        let bytes = bincode::serialize(&sig).unwrap();
        let result = bincode::deserialize::<Signature>(&bytes[..bytes.len() - 8]);
        assert!(result.is_err());
    }
}
