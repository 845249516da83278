//! Per-peer worker tasks.
//!
//! Each registered peer runs one read task and one write task. Writes
//! are serialized through a bounded per-peer send queue so handler code
//! never blocks on the socket; reads decode and authenticate envelopes
//! and dispatch them synchronously through the handler table.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use skald_hub::{ServiceMsg, ServiceReply, CHAIN_SVC, DEFAULT_REQUEST_TIMEOUT};
use skald_types::{PeerMeta, PeerState};

use crate::codec::{read_envelope, write_envelope};
use crate::handlers::{HandlerTable, PeerContext};
use crate::identity::NodeIdentity;
use crate::peer_manager::ManagerRef;
use crate::wire::{encode_payload, MessageData, Ping, ProtocolId};

/// Capacity of the per-peer send queue.
const SEND_QUEUE_SIZE: usize = 32;

/// Interval between keepalive pings on an otherwise idle connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared handle to a registered peer.
#[derive(Clone)]
pub struct RemotePeerHandle {
    pub meta: PeerMeta,
    state: Arc<AtomicU8>,
    sender: mpsc::Sender<MessageData>,
    stop: Arc<watch::Sender<bool>>,
}

impl RemotePeerHandle {
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Queue a message for delivery. Messages to peers that are not
    /// `Running` are silently dropped; a full queue drops the message
    /// with a log line rather than blocking the caller.
    pub fn send_message(&self, env: MessageData) {
        if self.state() != PeerState::Running {
            tracing::trace!(peer = %self.meta.id, state = ?self.state(), "dropping message to non-running peer");
            return;
        }
        if self.sender.try_send(env).is_err() {
            tracing::warn!(peer = %self.meta.id, "peer send queue full, dropping message");
        }
    }

    /// Tear the peer down: both worker tasks observe the stop signal
    /// and exit, closing the stream.
    pub fn stop(&self) {
        self.set_state(PeerState::Stopping);
        self.stop.send_replace(true);
    }
}

/// Spawn the read/write task pair for a handshaked peer and return its
/// handle. The handle starts in `Handshaking`; the registering side
/// moves it to `Running` once arbitration admits the peer.
pub fn spawn_peer_tasks<R, W>(
    meta: PeerMeta,
    reader: R,
    writer: W,
    manager: ManagerRef,
    handlers: Arc<HandlerTable>,
    identity: Arc<NodeIdentity>,
) -> RemotePeerHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_SIZE);
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = RemotePeerHandle {
        meta: meta.clone(),
        state: Arc::new(AtomicU8::new(PeerState::Handshaking as u8)),
        sender: send_tx,
        stop: Arc::new(stop_tx),
    };

    tokio::spawn(read_loop(
        meta.clone(),
        reader,
        manager.clone(),
        handlers,
        Arc::clone(&identity),
        handle.sender.clone(),
        stop_rx.clone(),
    ));
    tokio::spawn(write_loop(meta, writer, manager, identity, send_rx, stop_rx));

    handle
}

async fn read_loop<R>(
    meta: PeerMeta,
    mut reader: R,
    manager: ManagerRef,
    handlers: Arc<HandlerTable>,
    identity: Arc<NodeIdentity>,
    sender: mpsc::Sender<MessageData>,
    mut stop_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let ctx = PeerContext::new(meta.clone(), manager.clone(), identity, sender);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            result = read_envelope(&mut reader) => {
                let env = match result {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::info!(peer = %meta.id, error = %e, "peer read loop ended");
                        break;
                    }
                };

                // every inbound envelope after the handshake is authenticated
                let sender_id = match env.verify() {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::warn!(peer = %meta.id, error = %e, "dropping unauthenticated message");
                        continue;
                    }
                };
                if sender_id != meta.id {
                    tracing::warn!(
                        peer = %meta.id,
                        claimed = %sender_id,
                        "dropping message signed by a different identity"
                    );
                    continue;
                }

                match handlers.get(&env.protocol) {
                    Some(handler) => handler(&ctx, env).await,
                    None => {
                        tracing::warn!(peer = %meta.id, protocol = %env.protocol, "unknown protocol id, discarding");
                    }
                }
            }
        }
    }

    manager.request_remove(meta.id.clone()).await;
}

async fn write_loop<W>(
    meta: PeerMeta,
    mut writer: W,
    manager: ManagerRef,
    identity: Arc<NodeIdentity>,
    mut send_rx: mpsc::Receiver<MessageData>,
    mut stop_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut ping_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            msg = send_rx.recv() => {
                let Some(env) = msg else { break };
                if let Err(e) = write_envelope(&mut writer, &env).await {
                    tracing::info!(peer = %meta.id, error = %e, "peer write failed");
                    manager.request_remove(meta.id.clone()).await;
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if let Err(e) = send_ping(&mut writer, &manager, &identity).await {
                    tracing::info!(peer = %meta.id, error = %e, "keepalive ping failed");
                    manager.request_remove(meta.id.clone()).await;
                    break;
                }
            }
        }
    }
}

async fn send_ping<W>(
    writer: &mut W,
    manager: &ManagerRef,
    identity: &NodeIdentity,
) -> Result<(), crate::NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let (best_hash, best_no) = match manager
        .hub()
        .request(CHAIN_SVC, ServiceMsg::GetBestBlock, DEFAULT_REQUEST_TIMEOUT)
        .await
    {
        Ok(ServiceReply::BestBlock(block)) => (block.hash(), block.block_no()),
        _ => (skald_types::BlockId::ZERO, 0),
    };

    let body = encode_payload(&Ping { best_hash, best_no })?;
    let env = MessageData::new_signed(identity, ProtocolId::PingRequest, body)?;
    write_envelope(writer, &env).await
}
