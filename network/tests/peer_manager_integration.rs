//! Peer manager integration tests over real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use skald_crypto::generate_keypair;
use skald_hub::Hub;
use skald_network::{
    spawn_peer_manager, NodeIdentity, PeerManagerConfig, PeerManagerHandle,
};
use skald_types::{PeerMeta, PeerState};

async fn spawn_manager() -> PeerManagerHandle {
    let identity = Arc::new(NodeIdentity::new(generate_keypair()));
    let cfg = PeerManagerConfig {
        listen_ip: "127.0.0.1".to_string(),
        listen_port: 0,
        advertised_ip: None,
        max_peers: 8,
        peer_pool_size: 8,
        designated_peers: Vec::new(),
    };
    spawn_peer_manager(cfg, identity, Hub::new())
        .await
        .expect("spawn peer manager")
}

fn meta_of(handle: &PeerManagerHandle, designated: bool) -> PeerMeta {
    let mut meta = PeerMeta::new(handle.node_id().clone(), "127.0.0.1", handle.listen_port());
    meta.designated = designated;
    meta.outbound = true;
    meta
}

/// Poll until `check` holds, up to `deadline`.
async fn eventually<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn has_single_running_peer(handle: &PeerManagerHandle, expected: &PeerMeta) -> bool {
    let peers = handle.get_peers();
    peers.len() == 1
        && peers[0].meta.id == expected.id
        && peers[0].state() == PeerState::Running
}

#[tokio::test]
async fn outbound_connection_registers_on_both_sides() {
    let a = spawn_manager().await;
    let b = spawn_manager().await;
    let meta_a = meta_of(&a, false);
    let meta_b = meta_of(&b, false);

    a.add_new_peer(meta_b.clone()).await;

    assert!(
        eventually(Duration::from_secs(5), || has_single_running_peer(&a, &meta_b)).await,
        "dialer never registered the peer"
    );
    assert!(
        eventually(Duration::from_secs(5), || has_single_running_peer(&b, &meta_a)).await,
        "acceptor never registered the peer"
    );

    // get_peer agrees with the snapshot
    assert!(a.get_peer(&meta_b.id).is_some());
    assert!(b.get_peer(&meta_a.id).is_some());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn re_adding_a_managed_peer_does_not_duplicate_it() {
    let a = spawn_manager().await;
    let b = spawn_manager().await;
    let meta_b = meta_of(&b, false);

    a.add_new_peer(meta_b.clone()).await;
    assert!(eventually(Duration::from_secs(5), || has_single_running_peer(&a, &meta_b)).await);

    // at most one peer object per identity, no matter how often we add
    a.add_new_peer(meta_b.clone()).await;
    a.add_new_peer(meta_b.clone()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.get_peers().len(), 1);
    assert_eq!(b.get_peers().len(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn removed_peer_leaves_both_tables() {
    let a = spawn_manager().await;
    let b = spawn_manager().await;
    let meta_a = meta_of(&a, false);
    let meta_b = meta_of(&b, false);

    a.add_new_peer(meta_b.clone()).await;
    assert!(eventually(Duration::from_secs(5), || has_single_running_peer(&a, &meta_b)).await);
    assert!(eventually(Duration::from_secs(5), || has_single_running_peer(&b, &meta_a)).await);

    a.remove_peer(meta_b.id.clone()).await;

    assert!(
        eventually(Duration::from_secs(5), || a.get_peers().is_empty()).await,
        "removal did not clear the dialer table"
    );
    // the closed stream removes the peer on the remote side as well
    assert!(
        eventually(Duration::from_secs(5), || b.get_peers().is_empty()).await,
        "removal did not propagate to the acceptor"
    );

    a.stop().await;
    b.stop().await;
}

/// Simultaneous bidirectional dial: both sides converge to exactly one
/// registered peer per identity (the lower id yields its new stream).
/// Designated metas keep the reconnect path retrying through any
/// crossed-stream rounds.
#[tokio::test]
async fn simultaneous_dials_converge_to_one_peer_per_side() {
    let a = spawn_manager().await;
    let b = spawn_manager().await;
    let meta_a = meta_of(&a, true);
    let meta_b = meta_of(&b, true);

    tokio::join!(a.add_new_peer(meta_b.clone()), b.add_new_peer(meta_a.clone()));

    let stable = eventually(Duration::from_secs(15), || {
        has_single_running_peer(&a, &meta_b) && has_single_running_peer(&b, &meta_a)
    })
    .await;
    assert!(stable, "managers never converged to a single peer each");

    // hold the state for a moment to make sure it is not transient
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(has_single_running_peer(&a, &meta_b));
    assert!(has_single_running_peer(&b, &meta_a));

    a.stop().await;
    b.stop().await;
}
