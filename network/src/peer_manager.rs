//! The peer manager.
//!
//! Owns the node identity, the listening endpoint, the outbound dial
//! path, the candidate-address pool, and the table of registered
//! peers. Every mutation of the peer table happens on one serial
//! manager loop fed by a small set of bounded queues, which is what
//! guarantees at most one registered peer per identity. The loop
//! itself suspends only on channel receive: dial and handshake I/O
//! runs on per-connection tasks, inbound and outbound alike, which
//! report completed handshakes back over their own queues.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use skald_hub::{Hub, ServiceMsg, ServiceReply, CHAIN_SVC, DEFAULT_REQUEST_TIMEOUT, P2P_SVC};
use skald_types::{PeerId, PeerMeta, PeerState, PublicKey};

use crate::handlers::{default_handler_table, HandlerTable, PeerContext};
use crate::handshake::{inbound_handshake, outbound_handshake, HandshakeOutcome};
use crate::identity::NodeIdentity;
use crate::notice_cache::NoticeCache;
use crate::reconnect::{ConnectRegistry, ReconnectManager};
use crate::remote_peer::{spawn_peer_tasks, RemotePeerHandle};
use crate::wire::{
    encode_payload, GetBlocksRequest, GoAwayNotice, MessageData, NewBlockNotice, PeerAddress,
    ProtocolId, Status,
};
use crate::NetworkError;

/// Timeout for an outbound TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the address-solicitation tick.
const ADDR_COLLECT_INTERVAL: Duration = Duration::from_secs(180);

/// Page size for address solicitation.
const ADDRESSES_REQUEST_SIZE: u32 = 20;

/// Delay before designated peers are dialed at startup, giving the
/// chain service time to come up.
const DESIGNATED_DIAL_DELAY: Duration = Duration::from_secs(2);

/// Peer manager configuration.
#[derive(Clone, Debug)]
pub struct PeerManagerConfig {
    pub listen_ip: String,
    /// Port to listen on; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Address advertised to peers; defaults to `listen_ip`.
    pub advertised_ip: Option<String>,
    /// Upper bound on registered peers.
    pub max_peers: usize,
    /// Target size of the candidate-address pool; address solicitation
    /// stops once the pool reaches it.
    pub peer_pool_size: usize,
    /// Peers to keep permanently connected.
    pub designated_peers: Vec<PeerMeta>,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 7846,
            advertised_ip: None,
            max_peers: 20,
            peer_pool_size: 50,
            designated_peers: Vec::new(),
        }
    }
}

/// Table of registered peers plus the rebuilt-on-mutation snapshot
/// that `get_peers` hands out.
#[derive(Default)]
struct PeerTable {
    peers: HashMap<PeerId, RemotePeerHandle>,
    cache: Vec<RemotePeerHandle>,
}

/// The narrow back-capability held by per-peer workers and handlers:
/// read access to the peer table, the removal queue, the fill-pool
/// queue, the notice cache, and the hub.
#[derive(Clone)]
pub struct ManagerRef {
    remove_tx: mpsc::Sender<PeerId>,
    fill_tx: mpsc::Sender<Vec<PeerMeta>>,
    table: Arc<StdRwLock<PeerTable>>,
    notice_cache: Arc<StdMutex<NoticeCache>>,
    hub: Hub,
    self_meta: PeerMeta,
}

impl ManagerRef {
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn self_meta(&self) -> &PeerMeta {
        &self.self_meta
    }

    /// Registered (handshaked) peer by id.
    pub fn get_peer(&self, id: &PeerId) -> Option<RemotePeerHandle> {
        self.table
            .read()
            .expect("peer table lock poisoned")
            .peers
            .get(id)
            .cloned()
    }

    /// Stable snapshot of all registered peers.
    pub fn get_peers(&self) -> Vec<RemotePeerHandle> {
        self.table
            .read()
            .expect("peer table lock poisoned")
            .cache
            .clone()
    }

    /// Ask the manager loop to remove a peer.
    pub async fn request_remove(&self, id: PeerId) {
        let _ = self.remove_tx.send(id).await;
    }

    /// Forward a received address list to the manager loop.
    pub async fn notify_addresses(&self, metas: Vec<PeerMeta>) {
        let _ = self.fill_tx.send(metas).await;
    }

    /// Process a `newBlock/notice`: suppress duplicates through the
    /// bounded cache, look the block up at the chain service, and on a
    /// miss request the body back from the notifier.
    pub async fn handle_new_block_notice(&self, ctx: &PeerContext, notice: NewBlockNotice) {
        let duplicate = {
            let mut cache = self.notice_cache.lock().expect("notice cache lock poisoned");
            cache.contains_or_add(&notice.hash)
        };
        if duplicate {
            tracing::debug!(hash = %notice.hash, peer = %ctx.meta.id, "block notice already seen");
            return;
        }

        match self
            .hub
            .request(
                CHAIN_SVC,
                ServiceMsg::GetBlock { hash: notice.hash },
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await
        {
            Ok(ServiceReply::Block(Some(_))) => {}
            Ok(ServiceReply::Block(None)) | Ok(ServiceReply::Failed(_)) => {
                tracing::debug!(
                    hash = %notice.hash,
                    peer = %ctx.meta.id,
                    "block not found locally, requesting from notifier"
                );
                let _ = ctx
                    .send_payload(
                        ProtocolId::GetBlocksRequest,
                        &GetBlocksRequest {
                            hashes: vec![notice.hash],
                        },
                    )
                    .await;
            }
            Ok(other) => {
                tracing::warn!(reply = ?other, "chain service returned unexpected reply kind");
            }
            Err(e) => {
                tracing::warn!(error = %e, "chain service request failed for block notice");
            }
        }
    }
}

/// Public handle to a running peer manager.
pub struct PeerManagerHandle {
    mgr: ManagerRef,
    add_tx: mpsc::Sender<PeerMeta>,
    hs_tx: mpsc::Sender<PeerId>,
    finish_tx: mpsc::Sender<()>,
    identity: Arc<NodeIdentity>,
    listen_port: u16,
}

impl PeerManagerHandle {
    /// Request an outbound connection to `meta`.
    pub async fn add_new_peer(&self, meta: PeerMeta) {
        let _ = self.add_tx.send(meta).await;
    }

    /// Request removal of a registered peer.
    pub async fn remove_peer(&self, id: PeerId) {
        self.mgr.request_remove(id).await;
    }

    /// Notify that a peer finished its handshake, triggering address
    /// collection if the pool is low.
    pub async fn notify_peer_handshake(&self, id: PeerId) {
        let _ = self.hs_tx.send(id).await;
    }

    /// Feed a received peer-address list into the pool.
    pub async fn notify_peer_address_received(&self, metas: Vec<PeerMeta>) {
        self.mgr.notify_addresses(metas).await;
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<RemotePeerHandle> {
        self.mgr.get_peer(id)
    }

    pub fn get_peers(&self) -> Vec<RemotePeerHandle> {
        self.mgr.get_peers()
    }

    pub fn self_meta(&self) -> &PeerMeta {
        self.mgr.self_meta()
    }

    pub fn node_id(&self) -> &PeerId {
        &self.identity.peer_id
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    /// The narrow capability handed to collaborators.
    pub fn manager_ref(&self) -> ManagerRef {
        self.mgr.clone()
    }

    /// The actual listening port (useful when configured with port 0).
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Stop the manager loop, the listener, and every peer.
    pub async fn stop(&self) {
        let _ = self.finish_tx.send(()).await;
    }
}

/// A handshaked inbound connection awaiting registration on the
/// manager loop.
struct InboundPeer {
    outcome: HandshakeOutcome,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

/// The report of a spawned outbound dial task: either a handshaked
/// stream awaiting registration, or the failure that ended it.
struct OutboundDial {
    meta: PeerMeta,
    result: Result<(HandshakeOutcome, OwnedReadHalf, OwnedWriteHalf), NetworkError>,
}

/// Bind the listener and spawn the manager loop plus the accept loop.
pub async fn spawn_peer_manager(
    cfg: PeerManagerConfig,
    identity: Arc<NodeIdentity>,
    hub: Hub,
) -> Result<PeerManagerHandle, NetworkError> {
    let bind_addr = format!("{}:{}", cfg.listen_ip, cfg.listen_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| NetworkError::InvalidListenAddr(format!("{bind_addr}: {e}")))?;
    let listen_port = listener
        .local_addr()
        .map_err(|e| NetworkError::InvalidListenAddr(e.to_string()))?
        .port();

    let advertised_ip = cfg
        .advertised_ip
        .clone()
        .unwrap_or_else(|| cfg.listen_ip.clone());
    let mut self_meta = PeerMeta::new(identity.peer_id.clone(), advertised_ip, listen_port);
    self_meta.outbound = false;

    let (add_tx, add_rx) = mpsc::channel(2);
    let (remove_tx, remove_rx) = mpsc::channel(1);
    let (hs_tx, hs_rx) = mpsc::channel(1);
    let (fill_tx, fill_rx) = mpsc::channel(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(4);
    let (outbound_tx, outbound_rx) = mpsc::channel(4);
    let (finish_tx, finish_rx) = mpsc::channel(1);
    let (listener_stop_tx, listener_stop_rx) = watch::channel(false);

    let table = Arc::new(StdRwLock::new(PeerTable::default()));
    let notice_cache = Arc::new(StdMutex::new(NoticeCache::default()));

    let mgr = ManagerRef {
        remove_tx,
        fill_tx,
        table: Arc::clone(&table),
        notice_cache,
        hub: hub.clone(),
        self_meta: self_meta.clone(),
    };

    let mut designated = HashMap::new();
    for mut meta in cfg.designated_peers.clone() {
        meta.designated = true;
        meta.outbound = true;
        designated.insert(meta.id.clone(), meta);
    }

    let registry: Arc<dyn ConnectRegistry> = Arc::new(RegistryAdapter {
        table: Arc::clone(&table),
        add_tx: add_tx.clone(),
    });

    tokio::spawn(run_listener(
        listener,
        Arc::clone(&identity),
        hub.clone(),
        self_meta.clone(),
        inbound_tx,
        listener_stop_rx,
    ));

    // dial designated peers once the rest of the node has had a moment
    // to finish starting
    let startup_metas: Vec<PeerMeta> = designated.values().cloned().collect();
    if !startup_metas.is_empty() {
        let startup_add = add_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DESIGNATED_DIAL_DELAY).await;
            for meta in startup_metas {
                let _ = startup_add.send(meta).await;
            }
        });
    }

    let manager_loop = ManagerLoop {
        cfg,
        identity: Arc::clone(&identity),
        hub,
        mgr: mgr.clone(),
        handlers: Arc::new(default_handler_table()),
        peer_pool: HashMap::new(),
        designated,
        dialing: HashSet::new(),
        reconnect: ReconnectManager::new(),
        registry,
        outbound_tx,
        listener_stop_tx,
    };
    tokio::spawn(manager_loop.run(
        add_rx,
        remove_rx,
        hs_rx,
        fill_rx,
        inbound_rx,
        outbound_rx,
        finish_rx,
    ));

    Ok(PeerManagerHandle {
        mgr,
        add_tx,
        hs_tx,
        finish_tx,
        identity,
        listen_port,
    })
}

/// Handshake tie-break: when a second connection appears for an
/// already-registered identity, the side with the smaller (or equal)
/// id yields: it closes the new stream and keeps the existing peer.
fn yields_to_existing(self_id: &PeerId, remote_id: &PeerId) -> bool {
    self_id <= remote_id
}

struct ManagerLoop {
    cfg: PeerManagerConfig,
    identity: Arc<NodeIdentity>,
    hub: Hub,
    mgr: ManagerRef,
    handlers: Arc<HandlerTable>,
    peer_pool: HashMap<PeerId, PeerMeta>,
    designated: HashMap<PeerId, PeerMeta>,
    /// Peers with a dial task in flight, so a second add request does
    /// not race a duplicate connection.
    dialing: HashSet<PeerId>,
    reconnect: ReconnectManager,
    registry: Arc<dyn ConnectRegistry>,
    outbound_tx: mpsc::Sender<OutboundDial>,
    listener_stop_tx: watch::Sender<bool>,
}

impl ManagerLoop {
    async fn run(
        mut self,
        mut add_rx: mpsc::Receiver<PeerMeta>,
        mut remove_rx: mpsc::Receiver<PeerId>,
        mut hs_rx: mpsc::Receiver<PeerId>,
        mut fill_rx: mpsc::Receiver<Vec<PeerMeta>>,
        mut inbound_rx: mpsc::Receiver<InboundPeer>,
        mut outbound_rx: mpsc::Receiver<OutboundDial>,
        mut finish_rx: mpsc::Receiver<()>,
    ) {
        let mut addr_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + ADDR_COLLECT_INTERVAL,
            ADDR_COLLECT_INTERVAL,
        );

        loop {
            tokio::select! {
                Some(meta) = add_rx.recv() => {
                    self.start_dial(meta);
                }
                Some(id) = remove_rx.recv() => {
                    self.on_remove_peer(&id);
                }
                Some(id) = hs_rx.recv() => {
                    self.check_and_collect_peer_list(&id).await;
                }
                Some(metas) = fill_rx.recv() => {
                    self.try_fill_pool(metas);
                }
                Some(inbound) = inbound_rx.recv() => {
                    self.try_add_inbound(inbound).await;
                }
                Some(dial) = outbound_rx.recv() => {
                    self.on_outbound_dial(dial).await;
                }
                _ = addr_ticker.tick() => {
                    self.check_and_collect_peer_list_from_all().await;
                }
                _ = finish_rx.recv() => break,
            }
        }

        // shutdown: stop accepting, cancel reconnects, tear down peers
        self.listener_stop_tx.send_replace(true);
        self.reconnect.cancel_all();
        let ids: Vec<PeerId> = {
            let table = self.mgr.table.read().expect("peer table lock poisoned");
            table.peers.keys().cloned().collect()
        };
        for id in ids {
            self.delete_peer(&id);
        }
        tracing::info!("peer manager stopped");
    }

    /// Kick off an outbound connection attempt. The dial and handshake
    /// run on their own task so the manager loop never waits on
    /// network I/O; the result comes back through the outbound queue.
    fn start_dial(&mut self, mut meta: PeerMeta) {
        if meta.id == self.identity.peer_id {
            tracing::warn!("refusing to dial our own identity");
            return;
        }
        if meta.designated {
            self.designated
                .entry(meta.id.clone())
                .or_insert_with(|| meta.clone());
        }
        if self.mgr.get_peer(&meta.id).is_some() {
            tracing::info!(peer = %meta.id, "peer is already managed");
            if self.designated.contains_key(&meta.id) {
                self.reconnect.cancel_job(&meta.id);
            }
            return;
        }
        if !self.dialing.insert(meta.id.clone()) {
            tracing::debug!(peer = %meta.id, "dial already in flight");
            return;
        }

        meta.outbound = true;
        tokio::spawn(dial_peer(
            meta,
            Arc::clone(&self.identity),
            self.hub.clone(),
            self.mgr.self_meta().clone(),
            self.outbound_tx.clone(),
        ));
    }

    /// Register (or discard) the result of a finished dial task,
    /// arbitrating against an inbound connection that may have won the
    /// race while the handshake was in flight.
    async fn on_outbound_dial(&mut self, dial: OutboundDial) {
        let mut meta = dial.meta;
        self.dialing.remove(&meta.id);

        let (outcome, reader, writer) = match dial.result {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(peer = %meta.id, addr = %meta.dial_addr(), error = %e, "outbound connect failed");
                self.on_connect_failed(&meta);
                return;
            }
        };

        if self.mgr.get_peer(&meta.id).is_some() {
            if yields_to_existing(&self.identity.peer_id, &meta.id) {
                tracing::info!(peer = %meta.id, "peer was added while handshaking, keeping existing");
                return;
            }
            self.delete_peer(&meta.id);
        }

        meta.outbound = true;
        meta.designated = self.designated.contains_key(&meta.id);

        let handle = spawn_peer_tasks(
            meta.clone(),
            reader,
            writer,
            self.mgr.clone(),
            Arc::clone(&self.handlers),
            Arc::clone(&self.identity),
        );
        handle.set_state(PeerState::Running);
        self.insert_peer(handle);
        tracing::info!(peer = %meta.id, addr = %meta.multiaddr(), best_no = outcome.best_no, "outbound peer added");

        if meta.designated {
            self.reconnect.cancel_job(&meta.id);
        }
        self.check_and_collect_peer_list(&meta.id).await;
    }

    /// Register a handshaked inbound connection, arbitrating against a
    /// concurrent outbound connection to the same identity.
    async fn try_add_inbound(&mut self, inbound: InboundPeer) {
        let mut meta = inbound.outcome.meta;
        if meta.id == self.identity.peer_id {
            tracing::warn!("dropping inbound connection claiming our own identity");
            return;
        }

        if self.mgr.get_peer(&meta.id).is_some() {
            if yields_to_existing(&self.identity.peer_id, &meta.id) {
                tracing::debug!(peer = %meta.id, "duplicate inbound connection, keeping existing");
                return;
            }
            self.delete_peer(&meta.id);
        }

        meta.outbound = false;
        meta.designated = self.designated.contains_key(&meta.id);

        let handle = spawn_peer_tasks(
            meta.clone(),
            inbound.reader,
            inbound.writer,
            self.mgr.clone(),
            Arc::clone(&self.handlers),
            Arc::clone(&self.identity),
        );
        handle.set_state(PeerState::Running);
        self.insert_peer(handle);
        tracing::info!(peer = %meta.id, addr = %meta.multiaddr(), "inbound peer added");

        if meta.designated {
            self.reconnect.cancel_job(&meta.id);
        }
        self.check_and_collect_peer_list(&meta.id).await;
    }

    fn on_remove_peer(&mut self, id: &PeerId) {
        if self.delete_peer(id) {
            tracing::info!(peer = %id, "peer removed");
            if let Some(meta) = self.designated.get(id) {
                self.reconnect.add_job(meta.clone(), Arc::clone(&self.registry));
            }
        }
    }

    fn on_connect_failed(&mut self, meta: &PeerMeta) {
        if let Some(designated) = self.designated.get(&meta.id) {
            self.reconnect
                .add_job(designated.clone(), Arc::clone(&self.registry));
        }
    }

    fn insert_peer(&mut self, handle: RemotePeerHandle) {
        let mut table = self.mgr.table.write().expect("peer table lock poisoned");
        table.peers.insert(handle.meta.id.clone(), handle);
        table.cache = table.peers.values().cloned().collect();
    }

    fn delete_peer(&mut self, id: &PeerId) -> bool {
        let mut table = self.mgr.table.write().expect("peer table lock poisoned");
        let Some(handle) = table.peers.remove(id) else {
            return false;
        };
        handle.stop();
        table.cache = table.peers.values().cloned().collect();
        true
    }

    fn has_enough_peers(&self) -> bool {
        self.peer_pool.len() >= self.cfg.peer_pool_size
    }

    async fn check_and_collect_peer_list(&self, id: &PeerId) {
        if self.has_enough_peers() {
            return;
        }
        if self.mgr.get_peer(id).is_none() {
            tracing::warn!(peer = %id, "address collection for unknown peer id");
            return;
        }
        let _ = self
            .hub
            .tell(
                P2P_SVC,
                ServiceMsg::GetAddresses {
                    to: id.clone(),
                    size: ADDRESSES_REQUEST_SIZE,
                    offset: 0,
                },
            )
            .await;
    }

    async fn check_and_collect_peer_list_from_all(&self) {
        if self.has_enough_peers() {
            return;
        }
        for peer in self.mgr.get_peers() {
            let _ = self
                .hub
                .tell(
                    P2P_SVC,
                    ServiceMsg::GetAddresses {
                        to: peer.meta.id.clone(),
                        size: ADDRESSES_REQUEST_SIZE,
                        offset: 0,
                    },
                )
                .await;
        }
    }

    /// Add previously unknown addresses to the pool, then dial from
    /// the pool while below the peer limit.
    fn try_fill_pool(&mut self, metas: Vec<PeerMeta>) {
        let mut added = 0usize;
        for mut meta in metas {
            if meta.id == self.identity.peer_id || self.peer_pool.contains_key(&meta.id) {
                continue;
            }
            meta.outbound = true;
            meta.designated = false;
            self.peer_pool.insert(meta.id.clone(), meta);
            added += 1;
        }
        tracing::debug!(added, pool = self.peer_pool.len(), "filled peer address pool");
        self.try_connect_peers();
    }

    fn try_connect_peers(&mut self) {
        let connected = {
            let table = self.mgr.table.read().expect("peer table lock poisoned");
            table.peers.len()
        };
        // dials already in flight count against the budget
        let mut remained = self
            .cfg
            .max_peers
            .saturating_sub(connected)
            .saturating_sub(self.dialing.len());

        let candidates: Vec<PeerMeta> = self.peer_pool.values().cloned().collect();
        for meta in candidates {
            if remained == 0 {
                break;
            }
            // entries for peers that connected in the meantime are
            // evicted lazily here
            if self.mgr.get_peer(&meta.id).is_some() {
                self.peer_pool.remove(&meta.id);
                continue;
            }
            if meta.ip.is_empty() || meta.port == 0 {
                tracing::warn!(peer = %meta.id, "invalid peer meta in pool, skipping");
                continue;
            }
            self.start_dial(meta);
            remained -= 1;
        }
    }
}

/// Outbound dial task: connect, handshake, and report the result back
/// to the manager loop. Runs off the loop so a slow or unresponsive
/// address never stalls other peers.
async fn dial_peer(
    meta: PeerMeta,
    identity: Arc<NodeIdentity>,
    hub: Hub,
    self_meta: PeerMeta,
    outbound_tx: mpsc::Sender<OutboundDial>,
) {
    let result = connect_and_handshake(&meta, &identity, &hub, &self_meta).await;
    let _ = outbound_tx.send(OutboundDial { meta, result }).await;
}

async fn connect_and_handshake(
    meta: &PeerMeta,
    identity: &NodeIdentity,
    hub: &Hub,
    self_meta: &PeerMeta,
) -> Result<(HandshakeOutcome, OwnedReadHalf, OwnedWriteHalf), NetworkError> {
    let addr = meta.dial_addr();
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| NetworkError::ConnectTimeout(addr.clone()))??;

    let status = self_status(hub, self_meta).await;
    match outbound_handshake(&mut stream, identity, status, Some(&meta.id)).await {
        Ok(outcome) => {
            let (reader, writer) = stream.into_split();
            Ok((outcome, reader, writer))
        }
        Err(e) => {
            send_go_away(&mut stream, identity, "failed to handshake").await;
            Err(e)
        }
    }
}

/// Adapter giving the reconnect manager its narrow view of the peer
/// manager: presence checks and dial requests.
struct RegistryAdapter {
    table: Arc<StdRwLock<PeerTable>>,
    add_tx: mpsc::Sender<PeerMeta>,
}

impl ConnectRegistry for RegistryAdapter {
    fn peer_exists(&self, id: &PeerId) -> bool {
        self.table
            .read()
            .expect("peer table lock poisoned")
            .peers
            .contains_key(id)
    }

    fn add_new_peer(&self, meta: PeerMeta) {
        if self.add_tx.try_send(meta).is_err() {
            tracing::debug!("add-peer queue full, reconnect attempt deferred");
        }
    }
}

async fn run_listener(
    listener: TcpListener,
    identity: Arc<NodeIdentity>,
    hub: Hub,
    self_meta: PeerMeta,
    inbound_tx: mpsc::Sender<InboundPeer>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "inbound connection");
                        tokio::spawn(handle_inbound_conn(
                            stream,
                            Arc::clone(&identity),
                            hub.clone(),
                            self_meta.clone(),
                            inbound_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
    tracing::debug!("listener stopped");
}

async fn handle_inbound_conn(
    mut stream: TcpStream,
    identity: Arc<NodeIdentity>,
    hub: Hub,
    self_meta: PeerMeta,
    inbound_tx: mpsc::Sender<InboundPeer>,
) {
    let status = self_status(&hub, &self_meta).await;
    match inbound_handshake(&mut stream, &identity, status).await {
        Ok(outcome) => {
            let (reader, writer) = stream.into_split();
            let _ = inbound_tx
                .send(InboundPeer {
                    outcome,
                    reader,
                    writer,
                })
                .await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "inbound handshake failed");
            send_go_away(&mut stream, &identity, "failed to handshake").await;
        }
    }
}

/// Our handshake status: advertised address plus the chain head (zeros
/// while the chain service is unavailable).
async fn self_status(hub: &Hub, self_meta: &PeerMeta) -> Status {
    let (best_hash, best_no) = match hub
        .request(CHAIN_SVC, ServiceMsg::GetBestBlock, DEFAULT_REQUEST_TIMEOUT)
        .await
    {
        Ok(ServiceReply::BestBlock(block)) => (block.hash(), block.block_no()),
        _ => (skald_types::BlockId::ZERO, 0),
    };
    Status {
        sender: PeerAddress::from_meta(self_meta),
        best_hash,
        best_no,
    }
}

/// Best-effort goAway before dropping a stream.
async fn send_go_away(stream: &mut TcpStream, identity: &NodeIdentity, message: &str) {
    let Ok(body) = encode_payload(&GoAwayNotice {
        message: message.to_string(),
    }) else {
        return;
    };
    if let Ok(env) = MessageData::new_signed(identity, ProtocolId::GoAway, body) {
        let _ = crate::codec::write_envelope(stream, &env).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_hub::Delivery;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer_id(b: u8) -> PeerId {
        PeerId::from_bytes(vec![0x12, 0x20, b])
    }

    #[test]
    fn smaller_or_equal_id_yields() {
        let small = peer_id(1);
        let large = peer_id(2);
        assert!(yields_to_existing(&small, &large));
        assert!(yields_to_existing(&small, &small.clone()));
        assert!(!yields_to_existing(&large, &small));
    }

    fn test_manager_ref(hub: Hub) -> (ManagerRef, mpsc::Receiver<PeerId>, mpsc::Receiver<Vec<PeerMeta>>) {
        let (remove_tx, remove_rx) = mpsc::channel(4);
        let (fill_tx, fill_rx) = mpsc::channel(4);
        let mgr = ManagerRef {
            remove_tx,
            fill_tx,
            table: Arc::new(StdRwLock::new(PeerTable::default())),
            notice_cache: Arc::new(StdMutex::new(NoticeCache::default())),
            hub,
            self_meta: PeerMeta::new(peer_id(0xEE), "127.0.0.1", 0),
        };
        (mgr, remove_rx, fill_rx)
    }

    fn test_peer_context(
        mgr: &ManagerRef,
        id: PeerId,
    ) -> (PeerContext, mpsc::Receiver<MessageData>) {
        let identity = Arc::new(NodeIdentity::new(skald_crypto::generate_keypair()));
        let (tx, rx) = mpsc::channel(8);
        let meta = PeerMeta::new(id, "127.0.0.1", 7846);
        (PeerContext::new(meta, mgr.clone(), identity, tx), rx)
    }

    /// Duplicate notices within the cache window trigger exactly one
    /// chain-service lookup; the miss requests the body back from the
    /// first notifier only.
    #[tokio::test]
    async fn duplicate_block_notice_is_suppressed() {
        let hub = Hub::new();
        let mut chain_mailbox = hub.register(CHAIN_SVC, 8);

        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lookups);
        let chain = tokio::spawn(async move {
            while let Some(Delivery { msg, reply }) = chain_mailbox.recv().await {
                if let ServiceMsg::GetBlock { .. } = msg {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                if let Some(tx) = reply {
                    let _ = tx.send(ServiceReply::Block(None));
                }
            }
        });

        let (mgr, _remove_rx, _fill_rx) = test_manager_ref(hub.clone());
        let (ctx_a, mut out_a) = test_peer_context(&mgr, peer_id(0xA1));
        let (ctx_b, mut out_b) = test_peer_context(&mgr, peer_id(0xB2));

        let notice = NewBlockNotice {
            hash: skald_types::BlockId::new([0x77; 32]),
            no: 9,
        };
        mgr.handle_new_block_notice(&ctx_a, notice.clone()).await;
        mgr.handle_new_block_notice(&ctx_b, notice).await;

        assert_eq!(lookups.load(Ordering::SeqCst), 1);

        // the miss asked the first notifier for the body
        let env = out_a.try_recv().expect("request to notifier");
        assert_eq!(env.protocol, ProtocolId::GetBlocksRequest);
        assert!(out_b.try_recv().is_err());

        hub.deregister(CHAIN_SVC);
        drop(hub);
        chain.await.unwrap();
    }

    /// A known block does not trigger a back-request.
    #[tokio::test]
    async fn known_block_notice_requests_nothing() {
        let hub = Hub::new();
        let mut chain_mailbox = hub.register(CHAIN_SVC, 8);
        let chain = tokio::spawn(async move {
            while let Some(Delivery { reply, .. }) = chain_mailbox.recv().await {
                if let Some(tx) = reply {
                    let block = skald_types::Block::genesis(0);
                    let _ = tx.send(ServiceReply::Block(Some(block)));
                }
            }
        });

        let (mgr, _remove_rx, _fill_rx) = test_manager_ref(hub.clone());
        let (ctx, mut out) = test_peer_context(&mgr, peer_id(0xA1));
        mgr.handle_new_block_notice(
            &ctx,
            NewBlockNotice {
                hash: skald_types::BlockId::new([0x55; 32]),
                no: 3,
            },
        )
        .await;

        assert!(out.try_recv().is_err());

        hub.deregister(CHAIN_SVC);
        drop(hub);
        chain.await.unwrap();
    }
}
