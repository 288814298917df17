//! Reconnection with exponential backoff.
//!
//! The scheduler runs at most one retry task per target. Attempt `k`
//! (0-indexed) waits `initial * 2^k` before dialing; after `max_retry`
//! failures the task is abandoned and nothing happens for that target until
//! someone schedules it again.
//!
//! ```text
//! schedule ──► sleep(initial) ──► reconnect ──ok──► Succeeded
//!                                     │ err
//!                 sleep(initial * 2) ◄┘ ... ──max_retry──► Abandoned
//! ```
//!
//! Outcomes are published on a broadcast channel; see
//! [`ReconnectScheduler::subscribe`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Result, SeqlinkError};
use crate::BoxFuture;

/// Capacity of the outcome broadcast channel.
const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// Something that can be reconnected.
pub trait Reconnect: Send + Sync + 'static {
    /// Key identifying the remote end (its address).
    fn target(&self) -> String;

    /// Make one attempt to re-establish the connection.
    fn reconnect(&self) -> BoxFuture<'_, Result<()>>;
}

/// Final result of one retry episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// An attempt succeeded.
    Succeeded {
        /// Target key.
        target: String,
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed.
    Abandoned {
        /// Target key.
        target: String,
        /// Attempts made.
        attempts: u32,
    },
}

impl ReconnectOutcome {
    /// Target key of this outcome.
    pub fn target(&self) -> &str {
        match self {
            Self::Succeeded { target, .. } | Self::Abandoned { target, .. } => target,
        }
    }

    /// Attempts made on success, [`SeqlinkError::ReconnectExhausted`] if the
    /// episode was abandoned.
    pub fn into_result(self) -> Result<u32> {
        match self {
            Self::Succeeded { attempts, .. } => Ok(attempts),
            Self::Abandoned { target, attempts } => {
                Err(SeqlinkError::ReconnectExhausted { target, attempts })
            }
        }
    }
}

struct ActiveTask {
    id: u64,
    handle: JoinHandle<()>,
}

type ActiveMap = Arc<Mutex<HashMap<String, ActiveTask>>>;

/// Supervises retry tasks, one per target.
///
/// Dropping the scheduler cancels every active task.
pub struct ReconnectScheduler {
    backoff: Arc<[Duration]>,
    active: ActiveMap,
    next_task_id: AtomicU64,
    outcomes: broadcast::Sender<ReconnectOutcome>,
}

impl ReconnectScheduler {
    /// Scheduler making up to `max_retry` attempts starting `initial` apart.
    pub fn new(initial: Duration, max_retry: u32) -> Self {
        let backoff = (0..max_retry)
            .map(|k| initial.saturating_mul(2u32.checked_pow(k).unwrap_or(u32::MAX)))
            .collect::<Vec<_>>()
            .into();
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        Self {
            backoff,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicU64::new(1),
            outcomes,
        }
    }

    /// Delay before each attempt.
    pub fn backoff(&self) -> &[Duration] {
        &self.backoff
    }

    /// Start a retry task for `target` unless one is already running.
    ///
    /// Returns `false` when a task for the same key is active.
    pub fn schedule(&self, target: Arc<dyn Reconnect>) -> bool {
        let key = target.target();

        // Insert under the lock so a task that finishes immediately still
        // finds its own entry to remove.
        let mut active = self.active.lock();
        if active.contains_key(&key) {
            return false;
        }

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(retry(
            target,
            key.clone(),
            id,
            self.backoff.clone(),
            self.active.clone(),
            self.outcomes.clone(),
        ));
        active.insert(key.clone(), ActiveTask { id, handle });

        tracing::debug!(target = %key, "Reconnect scheduled");
        true
    }

    /// Receive every outcome published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectOutcome> {
        self.outcomes.subscribe()
    }

    /// Stop the task for `target`. Returns `false` if none was active.
    pub fn cancel(&self, target: &str) -> bool {
        match self.active.lock().remove(target) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a task for `target` is running.
    pub fn is_active(&self, target: &str) -> bool {
        self.active.lock().contains_key(target)
    }

    /// Number of running tasks.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Cancel every task.
    pub fn shutdown(&self) {
        for (_, task) in self.active.lock().drain() {
            task.handle.abort();
        }
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("backoff", &self.backoff)
            .field("active", &self.active_count())
            .finish()
    }
}

async fn retry(
    target: Arc<dyn Reconnect>,
    key: String,
    id: u64,
    backoff: Arc<[Duration]>,
    active: ActiveMap,
    outcomes: broadcast::Sender<ReconnectOutcome>,
) {
    let mut attempts = 0u32;
    let mut outcome = None;

    for delay in backoff.iter() {
        tokio::time::sleep(*delay).await;
        attempts += 1;

        match target.reconnect().await {
            Ok(()) => {
                tracing::info!(target = %key, attempts, "Reconnected");
                outcome = Some(ReconnectOutcome::Succeeded {
                    target: key.clone(),
                    attempts,
                });
                break;
            }
            Err(e) => {
                tracing::debug!(target = %key, attempt = attempts, error = %e, "Reconnect attempt failed");
            }
        }
    }

    let outcome = outcome.unwrap_or_else(|| {
        tracing::warn!(target = %key, attempts, "Reconnect abandoned");
        ReconnectOutcome::Abandoned {
            target: key.clone(),
            attempts,
        }
    });

    {
        let mut active = active.lock();
        if active.get(&key).is_some_and(|task| task.id == id) {
            active.remove(&key);
        }
    }
    let _ = outcomes.send(outcome);
}
