//! The peer handshake.
//!
//! Both directions exchange a signed `Status` envelope carrying the
//! sender's identity, dialable address, and chain head. The receiver
//! authenticates the envelope (pubkey → peer-id binding plus
//! signature) before the peer is eligible for registration; the
//! registration-time tie-break for simultaneous connections lives in
//! the peer manager.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use skald_types::{BlockId, BlockNo, PeerId, PeerMeta};

use crate::codec::{read_envelope, write_envelope};
use crate::identity::NodeIdentity;
use crate::wire::{decode_payload, encode_payload, MessageData, ProtocolId, Status};
use crate::NetworkError;

/// Time budget for reading the remote status during a handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a completed handshake learned about the remote peer.
#[derive(Clone, Debug)]
pub struct HandshakeOutcome {
    pub meta: PeerMeta,
    pub best_hash: BlockId,
    pub best_no: BlockNo,
}

/// Dial-side handshake: send our status, then read and authenticate
/// the remote status. When `expected` is set, the authenticated id
/// must match the id we meant to dial.
pub async fn outbound_handshake<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    self_status: Status,
    expected: Option<&PeerId>,
) -> Result<HandshakeOutcome, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_status(stream, identity, self_status).await?;
    let outcome = read_status(stream).await?;
    if let Some(expected) = expected {
        if outcome.meta.id != *expected {
            return Err(NetworkError::HandshakeFailed(format!(
                "dialed {expected} but reached {}",
                outcome.meta.id
            )));
        }
    }
    Ok(outcome)
}

/// Accept-side handshake: read and authenticate the initiator's
/// status, then reply with ours.
pub async fn inbound_handshake<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    self_status: Status,
) -> Result<HandshakeOutcome, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = read_status(stream).await?;
    send_status(stream, identity, self_status).await?;
    Ok(outcome)
}

async fn send_status<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    status: Status,
) -> Result<(), NetworkError>
where
    S: AsyncWrite + Unpin,
{
    let body = encode_payload(&status)?;
    let env = MessageData::new_signed(identity, ProtocolId::Status, body)?;
    tokio::time::timeout(HANDSHAKE_TIMEOUT, write_envelope(stream, &env))
        .await
        .map_err(|_| NetworkError::HandshakeFailed("status write timed out".to_string()))?
}

async fn read_status<S>(stream: &mut S) -> Result<HandshakeOutcome, NetworkError>
where
    S: AsyncRead + Unpin,
{
    let env = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_envelope(stream))
        .await
        .map_err(|_| NetworkError::HandshakeFailed("status read timed out".to_string()))??;

    if env.protocol != ProtocolId::Status {
        return Err(NetworkError::HandshakeFailed(format!(
            "expected status, got {}",
            env.protocol
        )));
    }

    let sender_id = env.verify()?;
    let status: Status = decode_payload(&env.body)?;
    if status.sender.id != sender_id {
        return Err(NetworkError::HandshakeFailed(
            "status sender does not match envelope identity".to_string(),
        ));
    }

    let meta = status.sender.into_meta();
    Ok(HandshakeOutcome {
        meta,
        best_hash: status.best_hash,
        best_no: status.best_no,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PeerAddress;
    use skald_crypto::generate_keypair;

    fn identity() -> NodeIdentity {
        NodeIdentity::new(generate_keypair())
    }

    fn status_for(identity: &NodeIdentity, port: u16) -> Status {
        Status {
            sender: PeerAddress {
                id: identity.peer_id.clone(),
                ip: "127.0.0.1".to_string(),
                port,
            },
            best_hash: BlockId::new([port as u8; 32]),
            best_no: port as u64,
        }
    }

    #[tokio::test]
    async fn both_sides_learn_each_other() {
        let dialer = identity();
        let acceptor = identity();
        let dialer_status = status_for(&dialer, 1001);
        let acceptor_status = status_for(&acceptor, 1002);

        let (mut client, mut server) = tokio::io::duplex(4096);

        let acceptor_id = acceptor.peer_id.clone();
        let server_task = tokio::spawn(async move {
            inbound_handshake(&mut server, &acceptor, acceptor_status).await
        });

        let outcome = outbound_handshake(&mut client, &dialer, dialer_status, Some(&acceptor_id))
            .await
            .expect("outbound handshake");
        assert_eq!(outcome.meta.id, acceptor_id);
        assert_eq!(outcome.meta.port, 1002);
        assert_eq!(outcome.best_no, 1002);

        let inbound = server_task.await.unwrap().expect("inbound handshake");
        assert_eq!(inbound.meta.id, dialer.peer_id);
        assert_eq!(inbound.best_no, 1001);
    }

    #[tokio::test]
    async fn dialing_the_wrong_identity_fails() {
        let dialer = identity();
        let acceptor = identity();
        let someone_else = identity();
        let dialer_status = status_for(&dialer, 1);
        let acceptor_status = status_for(&acceptor, 2);

        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            inbound_handshake(&mut server, &acceptor, acceptor_status).await
        });

        let err = outbound_handshake(
            &mut client,
            &dialer,
            dialer_status,
            Some(&someone_else.peer_id),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeFailed(_)));
        server_task.await.unwrap().expect("inbound side completed");
    }

    #[tokio::test]
    async fn status_claiming_foreign_sender_is_rejected() {
        let dialer = identity();
        let acceptor = identity();
        let imposter = identity();

        // dialer signs correctly but claims the imposter's address record
        let mut forged = status_for(&dialer, 1);
        forged.sender.id = imposter.peer_id.clone();

        let (mut client, mut server) = tokio::io::duplex(4096);
        let acceptor_status = status_for(&acceptor, 2);
        let server_task = tokio::spawn(async move {
            inbound_handshake(&mut server, &acceptor, acceptor_status).await
        });

        // we do not care whether the dial side errors first
        let _ = outbound_handshake(&mut client, &dialer, forged, None).await;

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn non_status_first_frame_is_rejected() {
        let dialer = identity();
        let acceptor = identity();

        let (mut client, mut server) = tokio::io::duplex(4096);
        let acceptor_status = status_for(&acceptor, 2);
        let server_task = tokio::spawn(async move {
            inbound_handshake(&mut server, &acceptor, acceptor_status).await
        });

        let env = MessageData::new_signed(&dialer, ProtocolId::PingRequest, Vec::new()).unwrap();
        write_envelope(&mut client, &env).await.unwrap();

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeFailed(_)));
    }
}
