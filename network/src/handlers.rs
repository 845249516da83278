//! The per-peer message handler table.
//!
//! A closed mapping from protocol id to handler, built once at peer
//! construction. Handlers run synchronously on the peer's read task
//! and talk to the rest of the node through the hub and the narrow
//! manager back-capability.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use skald_hub::{ServiceMsg, ServiceReply, CHAIN_SVC, DEFAULT_REQUEST_TIMEOUT, MEMPOOL_SVC};
use skald_types::{BlockId, PeerMeta};

use crate::identity::NodeIdentity;
use crate::peer_manager::ManagerRef;
use crate::wire::{
    decode_payload, encode_payload, AddressesRequest, AddressesResponse, GetBlockHeadersRequest,
    GetBlockHeadersResponse, GetBlocksRequest, GetBlocksResponse, GetMissingRequest, GetTxsRequest,
    GetTxsResponse, GoAwayNotice, MessageData, NewBlockNotice, NewTxNotice, PeerAddress, Ping,
    Pong, ProtocolId,
};
use crate::NetworkError;

/// Cap on blocks returned for a single header or missing-block walk.
const MAX_CHAIN_WALK: usize = 32;

/// Everything a handler may touch: the peer it serves, the local
/// identity, the hub, and the reply path into the peer's send queue.
pub struct PeerContext {
    pub meta: PeerMeta,
    pub manager: ManagerRef,
    identity: Arc<NodeIdentity>,
    sender: mpsc::Sender<MessageData>,
}

impl PeerContext {
    pub fn new(
        meta: PeerMeta,
        manager: ManagerRef,
        identity: Arc<NodeIdentity>,
        sender: mpsc::Sender<MessageData>,
    ) -> Self {
        Self {
            meta,
            manager,
            identity,
            sender,
        }
    }

    /// Sign and queue a payload for this peer.
    pub async fn send_payload<T: serde::Serialize>(
        &self,
        protocol: ProtocolId,
        payload: &T,
    ) -> Result<(), NetworkError> {
        let env = MessageData::new_signed(&self.identity, protocol, encode_payload(payload)?)?;
        self.sender
            .send(env)
            .await
            .map_err(|_| NetworkError::ChannelClosed)
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A message handler: dispatched on the read task, completes before
/// the next message of the same peer is processed.
pub type Handler = for<'a> fn(&'a PeerContext, MessageData) -> HandlerFuture<'a>;

/// The closed handler table, built at peer construction time.
pub struct HandlerTable {
    map: HashMap<ProtocolId, Handler>,
}

impl HandlerTable {
    pub fn get(&self, protocol: &ProtocolId) -> Option<&Handler> {
        self.map.get(protocol)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The default table covering the full protocol catalogue.
pub fn default_handler_table() -> HandlerTable {
    let mut map: HashMap<ProtocolId, Handler> = HashMap::new();
    map.insert(ProtocolId::PingRequest, ping_request);
    map.insert(ProtocolId::PingResponse, ping_response);
    map.insert(ProtocolId::GoAway, go_away);
    map.insert(ProtocolId::AddressesRequest, addresses_request);
    map.insert(ProtocolId::AddressesResponse, addresses_response);
    map.insert(ProtocolId::GetBlocksRequest, get_blocks_request);
    map.insert(ProtocolId::GetBlocksResponse, get_blocks_response);
    map.insert(ProtocolId::GetBlockHeadersRequest, get_block_headers_request);
    map.insert(ProtocolId::GetBlockHeadersResponse, get_block_headers_response);
    map.insert(ProtocolId::GetMissingRequest, get_missing_request);
    map.insert(ProtocolId::NewBlockNotice, new_block_notice);
    map.insert(ProtocolId::GetTxsRequest, get_txs_request);
    map.insert(ProtocolId::GetTxsResponse, get_txs_response);
    map.insert(ProtocolId::NewTxNotice, new_tx_notice);
    HandlerTable { map }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn ping_request<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        if let Err(e) = decode_payload::<Ping>(&env.body) {
            tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed ping");
            return;
        }
        let (best_hash, best_no) = best_block(ctx).await;
        let _ = ctx
            .send_payload(ProtocolId::PingResponse, &Pong { best_hash, best_no })
            .await;
    })
}

fn ping_response<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        match decode_payload::<Pong>(&env.body) {
            Ok(pong) => {
                tracing::trace!(peer = %ctx.meta.id, best_no = pong.best_no, "pong");
            }
            Err(e) => tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed pong"),
        }
    })
}

fn go_away<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let reason = decode_payload::<GoAwayNotice>(&env.body)
            .map(|n| n.message)
            .unwrap_or_else(|_| "<malformed>".to_string());
        tracing::info!(peer = %ctx.meta.id, reason = %reason, "peer sent goAway");
        ctx.manager.request_remove(ctx.meta.id.clone()).await;
    })
}

fn addresses_request<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let req = match decode_payload::<AddressesRequest>(&env.body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed addresses request");
                return;
            }
        };

        let peers: Vec<PeerAddress> = ctx
            .manager
            .get_peers()
            .into_iter()
            .filter(|p| p.meta.id != ctx.meta.id)
            .take(req.max_size as usize)
            .map(|p| PeerAddress::from_meta(&p.meta))
            .collect();

        let _ = ctx
            .send_payload(ProtocolId::AddressesResponse, &AddressesResponse { peers })
            .await;
    })
}

fn addresses_response<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let resp = match decode_payload::<AddressesResponse>(&env.body) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed addresses response");
                return;
            }
        };
        let metas: Vec<PeerMeta> = resp.peers.into_iter().map(PeerAddress::into_meta).collect();
        tracing::debug!(peer = %ctx.meta.id, count = metas.len(), "received peer addresses");
        ctx.manager.notify_addresses(metas).await;
    })
}

fn get_blocks_request<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let req = match decode_payload::<GetBlocksRequest>(&env.body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed block request");
                return;
            }
        };

        let mut blocks = Vec::with_capacity(req.hashes.len());
        for hash in req.hashes {
            match ctx
                .manager
                .hub()
                .request(CHAIN_SVC, ServiceMsg::GetBlock { hash }, DEFAULT_REQUEST_TIMEOUT)
                .await
            {
                Ok(ServiceReply::Block(Some(block))) => blocks.push(block),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(peer = %ctx.meta.id, error = %e, "chain service lookup failed");
                    return;
                }
            }
        }

        let _ = ctx
            .send_payload(ProtocolId::GetBlocksResponse, &GetBlocksResponse { blocks })
            .await;
    })
}

fn get_blocks_response<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let resp = match decode_payload::<GetBlocksResponse>(&env.body) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed block response");
                return;
            }
        };
        tracing::debug!(peer = %ctx.meta.id, count = resp.blocks.len(), "received blocks");
        for block in resp.blocks {
            let _ = ctx.manager.hub().tell(CHAIN_SVC, ServiceMsg::AddBlock { block }).await;
        }
    })
}

fn get_block_headers_request<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let req = match decode_payload::<GetBlockHeadersRequest>(&env.body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed header request");
                return;
            }
        };

        // walk prev-hash links from the requested start (or our best)
        let mut headers = Vec::new();
        let mut cursor = req.hash;
        let limit = (req.size as usize).min(MAX_CHAIN_WALK);
        while headers.len() < limit {
            let hash = match cursor {
                Some(h) => h,
                None => {
                    let (best, _) = best_block(ctx).await;
                    if best == BlockId::ZERO {
                        break;
                    }
                    best
                }
            };
            match ctx
                .manager
                .hub()
                .request(CHAIN_SVC, ServiceMsg::GetBlock { hash }, DEFAULT_REQUEST_TIMEOUT)
                .await
            {
                Ok(ServiceReply::Block(Some(block))) => {
                    let prev = block.header.prev_hash;
                    headers.push(block.header);
                    if prev == BlockId::ZERO {
                        break;
                    }
                    cursor = Some(prev);
                }
                _ => break,
            }
        }
        if req.asc {
            headers.reverse();
        }

        let _ = ctx
            .send_payload(
                ProtocolId::GetBlockHeadersResponse,
                &GetBlockHeadersResponse { headers },
            )
            .await;
    })
}

fn get_block_headers_response<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        match decode_payload::<GetBlockHeadersResponse>(&env.body) {
            Ok(resp) => {
                tracing::debug!(peer = %ctx.meta.id, count = resp.headers.len(), "received headers");
            }
            Err(e) => tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed header response"),
        }
    })
}

fn get_missing_request<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let req = match decode_payload::<GetMissingRequest>(&env.body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed missing-block request");
                return;
            }
        };

        // walk back from our best until we meet something the requester has
        let known: std::collections::HashSet<BlockId> =
            req.hashes.iter().copied().chain([req.stop_hash]).collect();
        let mut blocks = Vec::new();
        let (mut cursor, _) = best_block(ctx).await;
        while blocks.len() < MAX_CHAIN_WALK && cursor != BlockId::ZERO && !known.contains(&cursor) {
            match ctx
                .manager
                .hub()
                .request(
                    CHAIN_SVC,
                    ServiceMsg::GetBlock { hash: cursor },
                    DEFAULT_REQUEST_TIMEOUT,
                )
                .await
            {
                Ok(ServiceReply::Block(Some(block))) => {
                    cursor = block.header.prev_hash;
                    blocks.push(block);
                }
                _ => break,
            }
        }
        blocks.reverse();

        let _ = ctx
            .send_payload(ProtocolId::GetBlocksResponse, &GetBlocksResponse { blocks })
            .await;
    })
}

fn new_block_notice<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let notice = match decode_payload::<NewBlockNotice>(&env.body) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed block notice");
                return;
            }
        };
        ctx.manager.handle_new_block_notice(ctx, notice).await;
    })
}

fn get_txs_request<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let req = match decode_payload::<GetTxsRequest>(&env.body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed tx request");
                return;
            }
        };
        let txs = match ctx
            .manager
            .hub()
            .request(
                MEMPOOL_SVC,
                ServiceMsg::GetTxs { hashes: req.hashes },
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await
        {
            Ok(ServiceReply::Txs(txs)) => txs,
            _ => Vec::new(),
        };
        let _ = ctx
            .send_payload(ProtocolId::GetTxsResponse, &GetTxsResponse { txs })
            .await;
    })
}

fn get_txs_response<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let resp = match decode_payload::<GetTxsResponse>(&env.body) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed tx response");
                return;
            }
        };
        if !resp.txs.is_empty() {
            let _ = ctx
                .manager
                .hub()
                .tell(MEMPOOL_SVC, ServiceMsg::AddTxs { txs: resp.txs })
                .await;
        }
    })
}

fn new_tx_notice<'a>(ctx: &'a PeerContext, env: MessageData) -> HandlerFuture<'a> {
    Box::pin(async move {
        let notice = match decode_payload::<NewTxNotice>(&env.body) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(peer = %ctx.meta.id, error = %e, "malformed tx notice");
                return;
            }
        };
        if notice.tx_hashes.is_empty() {
            return;
        }
        // ask the notifier for the bodies; the mempool drops what it has
        let _ = ctx
            .send_payload(
                ProtocolId::GetTxsRequest,
                &GetTxsRequest {
                    hashes: notice.tx_hashes,
                },
            )
            .await;
    })
}

async fn best_block(ctx: &PeerContext) -> (BlockId, u64) {
    match ctx
        .manager
        .hub()
        .request(CHAIN_SVC, ServiceMsg::GetBestBlock, DEFAULT_REQUEST_TIMEOUT)
        .await
    {
        Ok(ServiceReply::BestBlock(block)) => (block.hash(), block.block_no()),
        _ => (BlockId::ZERO, 0),
    }
}
