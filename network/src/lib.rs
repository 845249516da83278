//! Peer lifecycle management and the skald wire protocol.
//!
//! The peer manager owns the listening endpoint and the node identity,
//! dials outbound peers, arbitrates simultaneous handshakes, and hosts
//! one reader/writer task pair per connected peer. All mutations of the
//! peer table are funneled through a single serial manager loop.

pub mod codec;
pub mod error;
pub mod handlers;
pub mod handshake;
pub mod identity;
pub mod notice_cache;
pub mod peer_manager;
pub mod reconnect;
pub mod remote_peer;
pub mod service;
pub mod wire;

pub use error::NetworkError;
pub use identity::NodeIdentity;
pub use notice_cache::NoticeCache;
pub use peer_manager::{spawn_peer_manager, ManagerRef, PeerManagerConfig, PeerManagerHandle};
pub use reconnect::{generate_exp_durations, ConnectRegistry, ReconnectManager};
pub use remote_peer::RemotePeerHandle;
pub use wire::{MessageData, ProtocolId};
