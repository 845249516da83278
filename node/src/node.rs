//! Node lifecycle: wiring of identity, storage, hub services, the peer
//! manager, and the block factory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use skald_crypto::{keypair_from_private, load_or_generate_keypair};
use skald_factory::{BlockFactory, BpInfo, Slot};
use skald_hub::{Hub, ServiceMsg, ServiceReply, CHAIN_SVC, DEFAULT_REQUEST_TIMEOUT, P2P_SVC};
use skald_network::service::run_p2p_service;
use skald_network::{spawn_peer_manager, NodeIdentity, PeerManagerConfig, PeerManagerHandle};
use skald_state::ChainStateDb;
use skald_types::{PeerId, PeerMeta};

use crate::chain_service::ChainService;
use crate::config::NodeConfig;
use crate::mempool::spawn_mempool_service;
use crate::NodeError;

/// Mailbox capacity for the chain and p2p services.
const SERVICE_MAILBOX: usize = 64;

/// A running skald node.
///
/// Shutdown follows the same idiom as the factory and reconnect jobs:
/// a `watch`-based quit signal that node-owned tasks select on. The
/// daemon binary owns OS signal handling and calls [`Node::stop`].
pub struct Node {
    hub: Hub,
    state: Arc<ChainStateDb>,
    peer_manager: PeerManagerHandle,
    factory: Option<BlockFactory>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Bring up every subsystem in dependency order: storage and the
    /// chain service first, then the mempool, the peer manager, the
    /// p2p service, and finally the block factory.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| NodeError::Config(format!("cannot create data dir: {e}")))?;

        let key_pair = load_or_generate_keypair(&config.resolved_key_file())
            .map_err(|e| NodeError::Key(e.to_string()))?;
        let producer_keys =
            keypair_from_private(&key_pair.private.0).map_err(|e| NodeError::Key(e.to_string()))?;
        let identity = Arc::new(NodeIdentity::new(key_pair));

        let hub = Hub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let chain = ChainService::init(&config.data_dir, hub.clone())?;
        let state = chain.state();
        let chain_mailbox = hub.register(CHAIN_SVC, SERVICE_MAILBOX);
        tokio::spawn(chain.run(chain_mailbox));

        spawn_mempool_service(&hub);

        let mut designated = Vec::with_capacity(config.designated_peers.len());
        for addr in &config.designated_peers {
            let Some(mut meta) = PeerMeta::from_multiaddr(addr) else {
                return Err(NodeError::Config(format!(
                    "invalid designated peer address: {addr}"
                )));
            };
            meta.designated = true;
            meta.outbound = true;
            designated.push(meta);
        }

        let pm_config = PeerManagerConfig {
            listen_ip: config.listen_ip.clone(),
            listen_port: config.listen_port,
            advertised_ip: config.advertised_ip.clone(),
            max_peers: config.max_peers,
            peer_pool_size: config.peer_pool_size,
            designated_peers: designated,
        };
        let peer_manager =
            spawn_peer_manager(pm_config, Arc::clone(&identity), hub.clone()).await?;

        let p2p_mailbox = hub.register(P2P_SVC, SERVICE_MAILBOX);
        tokio::spawn(run_p2p_service(
            p2p_mailbox,
            peer_manager.manager_ref(),
            Arc::clone(&identity),
        ));

        let factory = if config.enable_producer {
            let factory = BlockFactory::start(
                hub.clone(),
                Arc::new(producer_keys),
                config.max_block_body_bytes,
            );
            spawn_slot_ticker(
                hub.clone(),
                factory.job_queue(),
                Duration::from_millis(config.block_interval_ms),
                Duration::from_millis(config.bp_timeout_ms),
                shutdown_rx,
            );
            Some(factory)
        } else {
            None
        };

        tracing::info!(
            id = %identity.peer_id,
            port = peer_manager.listen_port(),
            producer = config.enable_producer,
            "skald node started"
        );

        Ok(Self {
            hub,
            state,
            peer_manager,
            factory,
            shutdown_tx,
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn state(&self) -> Arc<ChainStateDb> {
        Arc::clone(&self.state)
    }

    pub fn peer_manager(&self) -> &PeerManagerHandle {
        &self.peer_manager
    }

    pub fn node_id(&self) -> &PeerId {
        self.peer_manager.node_id()
    }

    /// Tear the node down: stop producing, stop the network, close the
    /// hub services, persist the state snapshot.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(factory) = &self.factory {
            factory.stop();
        }
        self.peer_manager.stop().await;
        // dropping the mailbox senders lets each service loop drain
        // and release its storage handles
        self.hub.deregister(CHAIN_SVC);
        self.hub.deregister(P2P_SVC);
        self.hub.deregister(skald_hub::MEMPOOL_SVC);
        if let Err(e) = self.state.close() {
            tracing::warn!(error = %e, "state snapshot persist failed during shutdown");
        }
        tracing::info!("skald node stopped");
    }
}

/// The single-producer slot loop: one production job per interval,
/// built on the current best block. Slots begin one interval after
/// startup so the rest of the node is up before the first block.
fn spawn_slot_ticker(
    hub: Hub,
    job_tx: mpsc::Sender<BpInfo>,
    interval: Duration,
    bp_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let best = match hub
                        .request(CHAIN_SVC, ServiceMsg::GetBestBlock, DEFAULT_REQUEST_TIMEOUT)
                        .await
                    {
                        Ok(ServiceReply::BestBlock(block)) => block,
                        _ => continue,
                    };
                    let slot = Slot::new(interval, bp_timeout, unix_now_nanos());
                    if job_tx
                        .try_send(BpInfo { slot, best_block: best })
                        .is_err()
                    {
                        tracing::debug!("slot job queue is full, skipping slot");
                    }
                }
            }
        }
        tracing::info!("slot ticker stopped");
    });
}

fn unix_now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
