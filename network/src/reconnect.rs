//! Reconnection scheduling for designated peers.
//!
//! When a designated peer drops, a job retries the connection on an
//! exponential backoff schedule. After the schedule is exhausted the
//! last interval repeats until the job is cancelled or the peer shows
//! up again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use skald_types::{PeerId, PeerMeta};

/// The reconnect manager's view of the peer manager.
pub trait ConnectRegistry: Send + Sync + 'static {
    /// Whether a registered peer exists for `id`.
    fn peer_exists(&self, id: &PeerId) -> bool;

    /// Request an outbound connection attempt.
    fn add_new_peer(&self, meta: PeerMeta);
}

/// Backoff schedule: `durations[i] = initial * (1 + inc)^i`, exactly
/// `count` entries, strictly increasing for any positive `inc`.
pub fn generate_exp_durations(initial: Duration, inc: f64, count: usize) -> Vec<Duration> {
    let base = initial.as_secs_f64();
    (0..count)
        .map(|i| Duration::from_secs_f64(base * (1.0 + inc).powi(i as i32)))
        .collect()
}

const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_INC: f64 = 0.6;
const DEFAULT_MAX_TRIAL: usize = 15;

/// Schedules one reconnect job per designated peer.
pub struct ReconnectManager {
    durations: Arc<Vec<Duration>>,
    jobs: Arc<Mutex<HashMap<PeerId, watch::Sender<bool>>>>,
}

impl ReconnectManager {
    pub fn new() -> Self {
        Self::with_durations(generate_exp_durations(
            DEFAULT_INITIAL,
            DEFAULT_INC,
            DEFAULT_MAX_TRIAL,
        ))
    }

    /// Use an explicit schedule; the last entry repeats once the
    /// schedule is exhausted.
    pub fn with_durations(durations: Vec<Duration>) -> Self {
        assert!(!durations.is_empty(), "reconnect schedule must not be empty");
        Self {
            durations: Arc::new(durations),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a reconnect job for `meta`. Idempotent: an existing job
    /// for the same peer is left alone.
    pub fn add_job(&self, meta: PeerMeta, registry: Arc<dyn ConnectRegistry>) {
        let mut jobs = self.jobs.lock().expect("reconnect jobs lock poisoned");
        if jobs.contains_key(&meta.id) {
            return;
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        jobs.insert(meta.id.clone(), cancel_tx);

        let durations = Arc::clone(&self.durations);
        let jobs_ref = Arc::clone(&self.jobs);
        tracing::info!(peer = %meta.id, "scheduling reconnect job");

        tokio::spawn(async move {
            let mut trial = 0usize;
            loop {
                let wait = durations[trial.min(durations.len() - 1)];
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        tracing::debug!(peer = %meta.id, "reconnect job cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                if registry.peer_exists(&meta.id) {
                    tracing::info!(peer = %meta.id, "peer is back, reconnect job done");
                    break;
                }
                tracing::debug!(peer = %meta.id, trial, "reconnect attempt");
                registry.add_new_peer(meta.clone());
                trial += 1;
            }
            jobs_ref
                .lock()
                .expect("reconnect jobs lock poisoned")
                .remove(&meta.id);
        });
    }

    /// Cancel the job for `id`, waking it out of its backoff sleep.
    pub fn cancel_job(&self, id: &PeerId) {
        let mut jobs = self.jobs.lock().expect("reconnect jobs lock poisoned");
        if let Some(cancel) = jobs.remove(id) {
            cancel.send_replace(true);
        }
    }

    /// Cancel every job.
    pub fn cancel_all(&self) {
        let mut jobs = self.jobs.lock().expect("reconnect jobs lock poisoned");
        for (_, cancel) in jobs.drain() {
            cancel.send_replace(true);
        }
    }

    pub fn has_job(&self, id: &PeerId) -> bool {
        self.jobs
            .lock()
            .expect("reconnect jobs lock poisoned")
            .contains_key(id)
    }
}

impl Default for ReconnectManager {
    fn default() -> Self {
        Self::new()
    }
}
