//! The component hub.
//!
//! Long-lived services register under a name and receive messages
//! through a bounded mailbox. Senders either `tell` (fire-and-forget)
//! or `request` (reply expected within a timeout, carried on a oneshot
//! channel). The message and reply sets are closed enums: every
//! inter-component interaction in the node is listed here.
//!
//! Service loops follow a resume-on-error discipline: a handler error
//! is logged, the offending message is dropped, and the loop continues
//! with the next message. That is the containment boundary around
//! handler code.

pub mod message;

pub use message::{ServiceMsg, ServiceReply};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Well-known service names.
pub const CHAIN_SVC: &str = "chain";
pub const MEMPOOL_SVC: &str = "mempool";
pub const P2P_SVC: &str = "p2p";

/// Default timeout for hub requests issued from peer handlers.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HubError {
    #[error("no such service: {0}")]
    NoSuchService(String),

    #[error("service {0} is not accepting messages")]
    ServiceClosed(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("service {0} dropped the reply channel")]
    NoReply(String),
}

/// A message delivered to a service mailbox. `reply` is present for
/// requests and absent for tells.
pub struct Delivery {
    pub msg: ServiceMsg,
    pub reply: Option<oneshot::Sender<ServiceReply>>,
}

impl Delivery {
    /// Send a reply if the sender expects one. Replies to tells are
    /// silently discarded.
    pub fn respond(self, reply: ServiceReply) {
        if let Some(tx) = self.reply {
            let _ = tx.send(reply);
        }
    }
}

/// Mailbox receiver handed to a service at registration.
pub type Mailbox = mpsc::Receiver<Delivery>;

/// Registry of named services. Cheap to clone; all clones share the
/// same registry.
#[derive(Clone, Default)]
pub struct Hub {
    services: Arc<RwLock<HashMap<String, mpsc::Sender<Delivery>>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service and get its mailbox. Re-registering a name
    /// replaces the previous mailbox sender.
    pub fn register(&self, name: &str, capacity: usize) -> Mailbox {
        let (tx, rx) = mpsc::channel(capacity);
        self.services
            .write()
            .expect("hub registry lock poisoned")
            .insert(name.to_string(), tx);
        rx
    }

    /// Remove a service from the registry.
    pub fn deregister(&self, name: &str) {
        self.services
            .write()
            .expect("hub registry lock poisoned")
            .remove(name);
    }

    fn sender_for(&self, name: &str) -> Result<mpsc::Sender<Delivery>, HubError> {
        self.services
            .read()
            .expect("hub registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::NoSuchService(name.to_string()))
    }

    /// Fire-and-forget send to a named service.
    pub async fn tell(&self, name: &str, msg: ServiceMsg) -> Result<(), HubError> {
        let tx = self.sender_for(name)?;
        tx.send(Delivery { msg, reply: None })
            .await
            .map_err(|_| HubError::ServiceClosed(name.to_string()))
    }

    /// Request/response with a timeout.
    pub async fn request(
        &self,
        name: &str,
        msg: ServiceMsg,
        timeout: Duration,
    ) -> Result<ServiceReply, HubError> {
        let tx = self.sender_for(name)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Delivery {
            msg,
            reply: Some(reply_tx),
        })
        .await
        .map_err(|_| HubError::ServiceClosed(name.to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(HubError::NoReply(name.to_string())),
            Err(_) => Err(HubError::Timeout(name.to_string())),
        }
    }
}

/// Drive a service loop with resume-on-error supervision: `handle` is
/// called per delivery; an `Err` is logged and the loop continues.
/// Returns when the mailbox closes.
pub async fn run_service<F, E>(name: &'static str, mut mailbox: Mailbox, mut handle: F)
where
    F: FnMut(Delivery) -> Result<(), E>,
    E: std::fmt::Display,
{
    while let Some(delivery) = mailbox.recv().await {
        if let Err(e) = handle(delivery) {
            tracing::warn!(service = name, error = %e, "service handler failed, resuming");
        }
    }
    tracing::info!(service = name, "service mailbox closed");
}
