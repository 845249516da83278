//! The mempool service: FIFO of pending transactions.
//!
//! Storage sophistication (priority, eviction, fee ordering) lives
//! outside the core; the factory and peer handlers only need gather,
//! lookup, admit, and remove.

use std::collections::{HashSet, VecDeque};

use skald_hub::{run_service, Delivery, Hub, ServiceMsg, ServiceReply, MEMPOOL_SVC};
use skald_types::{SignedTx, TxHash};

/// Mailbox capacity for the mempool service.
const MEMPOOL_MAILBOX: usize = 64;

#[derive(Default)]
struct Mempool {
    queue: VecDeque<SignedTx>,
    known: HashSet<TxHash>,
}

impl Mempool {
    fn handle(&mut self, delivery: Delivery) -> Result<(), String> {
        let Delivery { msg, reply } = delivery;
        let response = match msg {
            ServiceMsg::GatherTxs { limit } => {
                let txs: Vec<SignedTx> = self.queue.iter().take(limit).cloned().collect();
                ServiceReply::Txs(txs)
            }
            ServiceMsg::AddTxs { txs } => {
                let mut admitted = 0usize;
                for tx in txs {
                    if self.known.insert(tx.hash) {
                        self.queue.push_back(tx);
                        admitted += 1;
                    }
                }
                tracing::debug!(admitted, pending = self.queue.len(), "admitted transactions");
                ServiceReply::Done
            }
            ServiceMsg::RemoveTxs { hashes } => {
                let drop: HashSet<TxHash> = hashes.into_iter().collect();
                self.queue.retain(|tx| !drop.contains(&tx.hash));
                for hash in &drop {
                    self.known.remove(hash);
                }
                ServiceReply::Done
            }
            ServiceMsg::GetTxs { hashes } => {
                let wanted: HashSet<TxHash> = hashes.into_iter().collect();
                let txs: Vec<SignedTx> = self
                    .queue
                    .iter()
                    .filter(|tx| wanted.contains(&tx.hash))
                    .cloned()
                    .collect();
                ServiceReply::Txs(txs)
            }
            other => {
                if let Some(tx) = reply {
                    let _ = tx.send(ServiceReply::Failed("unexpected message".to_string()));
                }
                return Err(format!("unexpected message: {other:?}"));
            }
        };
        if let Some(tx) = reply {
            let _ = tx.send(response);
        }
        Ok(())
    }
}

/// Register and spawn the mempool service on the hub.
pub fn spawn_mempool_service(hub: &Hub) {
    let mailbox = hub.register(MEMPOOL_SVC, MEMPOOL_MAILBOX);
    let mut pool = Mempool::default();
    tokio::spawn(run_service(MEMPOOL_SVC, mailbox, move |delivery| {
        pool.handle(delivery)
    }));
}
