//! The p2p hub service.
//!
//! Other components reach the network through this mailbox: block
//! notices fan out to every running peer, and targeted requests are
//! routed to a single peer's send queue.

use std::sync::Arc;

use skald_hub::{Delivery, Mailbox, ServiceMsg, ServiceReply};
use skald_types::{PeerId, PeerState};

use crate::identity::NodeIdentity;
use crate::peer_manager::ManagerRef;
use crate::wire::{
    encode_payload, AddressesRequest, GetBlocksRequest, MessageData, NewBlockNotice, PeerAddress,
    ProtocolId,
};
use crate::NetworkError;

/// Drive the p2p service until its mailbox closes.
pub async fn run_p2p_service(mut mailbox: Mailbox, mgr: ManagerRef, identity: Arc<NodeIdentity>) {
    while let Some(Delivery { msg, reply }) = mailbox.recv().await {
        let result = match msg {
            ServiceMsg::NotifyNewBlock { no, hash } => {
                notify_new_block(&mgr, &identity, hash, no)
            }
            ServiceMsg::GetBlockInfos { to, hashes } => send_to_peer(
                &mgr,
                &identity,
                &to,
                ProtocolId::GetBlocksRequest,
                &GetBlocksRequest { hashes },
            ),
            ServiceMsg::GetAddresses { to, size, offset } => send_to_peer(
                &mgr,
                &identity,
                &to,
                ProtocolId::AddressesRequest,
                &AddressesRequest {
                    sender: PeerAddress::from_meta(mgr.self_meta()),
                    max_size: size,
                    offset,
                },
            ),
            other => {
                tracing::warn!(msg = ?other, "p2p service received unexpected message");
                Err(NetworkError::Serialization("unexpected message".to_string()))
            }
        };

        if let Some(tx) = reply {
            let _ = tx.send(match result {
                Ok(()) => ServiceReply::Done,
                Err(e) => ServiceReply::Failed(e.to_string()),
            });
        } else if let Err(e) = result {
            tracing::warn!(error = %e, "p2p service handler failed, resuming");
        }
    }
    tracing::info!("p2p service mailbox closed");
}

/// Broadcast a block notice to every running peer. Peers in any other
/// state are skipped.
fn notify_new_block(
    mgr: &ManagerRef,
    identity: &NodeIdentity,
    hash: skald_types::BlockId,
    no: u64,
) -> Result<(), NetworkError> {
    let body = encode_payload(&NewBlockNotice { hash, no })?;
    let mut notified = 0usize;
    for peer in mgr.get_peers() {
        if peer.state() != PeerState::Running {
            continue;
        }
        let env = MessageData::new_signed(identity, ProtocolId::NewBlockNotice, body.clone())?;
        peer.send_message(env);
        notified += 1;
    }
    tracing::debug!(%hash, no, notified, "broadcast new block notice");
    Ok(())
}

fn send_to_peer<T: serde::Serialize>(
    mgr: &ManagerRef,
    identity: &NodeIdentity,
    to: &PeerId,
    protocol: ProtocolId,
    payload: &T,
) -> Result<(), NetworkError> {
    let Some(peer) = mgr.get_peer(to) else {
        tracing::warn!(peer = %to, protocol = %protocol, "message to unknown peer");
        return Ok(());
    };
    let env = MessageData::new_signed(identity, protocol, encode_payload(payload)?)?;
    peer.send_message(env);
    Ok(())
}
