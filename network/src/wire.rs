//! The wire message envelope and the protocol catalogue.
//!
//! Every message on a peer stream is a [`MessageData`] envelope carrying
//! the sender identity, a Secp256k1/SHA-256 signature, and the
//! protocol-specific body. The signature covers the envelope with the
//! sign field cleared, concatenated with the body bytes.

use serde::{Deserialize, Serialize};

use skald_crypto::{derive_peer_id, sign_message, verify_signature};
use skald_types::{
    Block, BlockHeader, BlockId, BlockNo, PeerId, PeerMeta, PublicKey, Signature, SignedTx, TxHash,
};

use crate::identity::NodeIdentity;
use crate::NetworkError;

/// Identifiers of the sub-protocols spoken between peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    /// Handshake status exchange.
    Status,
    PingRequest,
    PingResponse,
    GoAway,
    AddressesRequest,
    AddressesResponse,
    GetBlocksRequest,
    GetBlocksResponse,
    GetBlockHeadersRequest,
    GetBlockHeadersResponse,
    GetMissingRequest,
    NewBlockNotice,
    GetTxsRequest,
    GetTxsResponse,
    NewTxNotice,
}

impl ProtocolId {
    /// The short wire name of the protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::PingRequest => "ping/req",
            Self::PingResponse => "ping/resp",
            Self::GoAway => "goAway",
            Self::AddressesRequest => "addresses/req",
            Self::AddressesResponse => "addresses/resp",
            Self::GetBlocksRequest => "getBlocks/req",
            Self::GetBlocksResponse => "getBlocks/resp",
            Self::GetBlockHeadersRequest => "getBlockHeaders/req",
            Self::GetBlockHeadersResponse => "getBlockHeaders/resp",
            Self::GetMissingRequest => "getMissing/req",
            Self::NewBlockNotice => "newBlock/notice",
            Self::GetTxsRequest => "getTXs/req",
            Self::GetTxsResponse => "getTXs/resp",
            Self::NewTxNotice => "newTX/notice",
        }
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope wrapped around every wire message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageData {
    pub protocol: ProtocolId,
    /// Base58 peer id of the sender.
    pub peer_id: String,
    pub node_pub_key: PublicKey,
    /// Unix time in seconds at send.
    pub timestamp: u64,
    /// Secp256k1/SHA-256 signature; empty only while being built.
    pub sign: Vec<u8>,
    /// Protocol-specific payload bytes.
    pub body: Vec<u8>,
}

impl MessageData {
    /// Build and sign an envelope for `body` under the local identity.
    pub fn new_signed(
        identity: &NodeIdentity,
        protocol: ProtocolId,
        body: Vec<u8>,
    ) -> Result<Self, NetworkError> {
        let mut env = Self {
            protocol,
            peer_id: identity.peer_id.to_base58(),
            node_pub_key: identity.public_key().clone(),
            timestamp: unix_now_secs(),
            sign: Vec::new(),
            body,
        };
        let signable = env.signable_bytes()?;
        let sig = sign_message(&signable, &identity.key_pair.private);
        env.sign = sig.as_bytes().to_vec();
        Ok(env)
    }

    /// The bytes the signature covers: the envelope with `sign` cleared
    /// and `body` detached, concatenated with the body.
    fn signable_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        let header = Self {
            protocol: self.protocol,
            peer_id: self.peer_id.clone(),
            node_pub_key: self.node_pub_key.clone(),
            timestamp: self.timestamp,
            sign: Vec::new(),
            body: Vec::new(),
        };
        let mut buf = bincode::serialize(&header)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Authenticate the envelope: the embedded public key must derive
    /// the claimed peer id and the signature must verify. Returns the
    /// authenticated sender id.
    pub fn verify(&self) -> Result<PeerId, NetworkError> {
        let derived = derive_peer_id(&self.node_pub_key);
        if derived.to_base58() != self.peer_id {
            return Err(NetworkError::IdentityMismatch {
                derived: derived.to_base58(),
                claimed: self.peer_id.clone(),
            });
        }

        let sig_bytes: [u8; 64] = self
            .sign
            .as_slice()
            .try_into()
            .map_err(|_| NetworkError::InvalidSignature)?;
        let signable = self.signable_bytes()?;
        if !verify_signature(&signable, &Signature(sig_bytes), &self.node_pub_key) {
            return Err(NetworkError::InvalidSignature);
        }
        Ok(derived)
    }
}

/// Encode a payload struct for the envelope body.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, NetworkError> {
    bincode::serialize(payload).map_err(|e| NetworkError::Serialization(e.to_string()))
}

/// Decode an envelope body into a payload struct.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, NetworkError> {
    bincode::deserialize(body).map_err(|e| NetworkError::Serialization(e.to_string()))
}

pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A peer's dialable address as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: PeerId,
    pub ip: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn from_meta(meta: &PeerMeta) -> Self {
        Self {
            id: meta.id.clone(),
            ip: meta.ip.clone(),
            port: meta.port,
        }
    }

    pub fn into_meta(self) -> PeerMeta {
        PeerMeta::new(self.id, self.ip, self.port)
    }
}

/// Handshake payload: the sender's address and chain head.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub sender: PeerAddress,
    pub best_hash: BlockId,
    pub best_no: BlockNo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ping {
    pub best_hash: BlockId,
    pub best_no: BlockNo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pong {
    pub best_hash: BlockId,
    pub best_no: BlockNo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GoAwayNotice {
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressesRequest {
    pub sender: PeerAddress,
    pub max_size: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressesResponse {
    pub peers: Vec<PeerAddress>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlocksRequest {
    pub hashes: Vec<BlockId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlocksResponse {
    pub blocks: Vec<Block>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlockHeadersRequest {
    /// Start hash; `None` starts from the receiver's best block.
    pub hash: Option<BlockId>,
    pub height: BlockNo,
    pub offset: u32,
    pub size: u32,
    pub asc: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlockHeadersResponse {
    pub headers: Vec<BlockHeader>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetMissingRequest {
    /// Hashes the requester already has, most recent first.
    pub hashes: Vec<BlockId>,
    pub stop_hash: BlockId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewBlockNotice {
    pub hash: BlockId,
    pub no: BlockNo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTxsRequest {
    pub hashes: Vec<TxHash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTxsResponse {
    pub txs: Vec<SignedTx>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTxNotice {
    pub tx_hashes: Vec<TxHash>,
}
