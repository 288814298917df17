//! Client registry: lookup by address and group, plus supervision.
//!
//! The registry indexes clients by remote address and by [`ClientGroup`] and
//! periodically hands closed clients to a [`ReconnectScheduler`]. Every
//! closure episode is handed over exactly once: the client is flagged when
//! its reconnect is requested and unflagged once it is seen open again (or a
//! `Succeeded` outcome is reported), so the next closure starts a fresh
//! episode.
//!
//! # Example
//!
//! ```ignore
//! let scheduler = Arc::new(ReconnectScheduler::new(Duration::from_millis(500), 5));
//! let registry = Arc::new(ClientRegistry::new(scheduler));
//!
//! registry.add(ClientGroup::new("quotes", "eu-1"), client);
//! let _supervisor = registry.spawn_supervisor(DEFAULT_SUPERVISE_INTERVAL);
//!
//! for member in registry.find_clients("quotes", |c| c.remote_addr() == origin) {
//!     member.async_write(Packet::with_seq(0, update.clone()))?;
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::reconnect::{Reconnect, ReconnectOutcome, ReconnectScheduler};

/// Default period of the supervision loop.
pub const DEFAULT_SUPERVISE_INTERVAL: Duration = Duration::from_secs(5);

/// Classification tag for a client. Carries no behavior.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientGroup {
    /// Group identifier used by [`ClientRegistry::find_clients`].
    pub id: String,
    /// Free-form key within the group.
    pub key: String,
}

impl ClientGroup {
    /// Create a group tag.
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    by_addr: HashMap<SocketAddr, Client>,
    group_of: HashMap<SocketAddr, ClientGroup>,
    by_group: HashMap<String, Vec<Client>>,
    /// Targets whose current closure episode was already handed over.
    reconnect_pending: HashSet<String>,
}

/// Index of clients with reconnect supervision.
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
    scheduler: Arc<ReconnectScheduler>,
    outcomes: Mutex<broadcast::Receiver<ReconnectOutcome>>,
    idle_eviction: bool,
}

impl ClientRegistry {
    /// Create an empty registry using `scheduler` for reconnects.
    pub fn new(scheduler: Arc<ReconnectScheduler>) -> Self {
        let outcomes = Mutex::new(scheduler.subscribe());
        Self {
            state: Mutex::new(RegistryState::default()),
            scheduler,
            outcomes,
            idle_eviction: false,
        }
    }

    /// Also close (and so reconnect) open clients whose session reports
    /// idle. Off by default.
    pub fn with_idle_eviction(mut self, enabled: bool) -> Self {
        self.idle_eviction = enabled;
        self
    }

    /// The scheduler reconnects are handed to.
    pub fn scheduler(&self) -> &Arc<ReconnectScheduler> {
        &self.scheduler
    }

    /// Track `client` under `group`. Replaces any client with the same
    /// remote address.
    pub fn add(&self, group: ClientGroup, client: Client) {
        let addr = client.remote_addr();
        let mut state = self.state.lock();
        Self::unlink(&mut state, addr);

        state
            .by_group
            .entry(group.id.clone())
            .or_default()
            .push(client.clone());
        state.group_of.insert(addr, group);
        state.by_addr.insert(addr, client);
    }

    /// Stop tracking the client at `addr` and cancel its reconnect task.
    pub fn remove(&self, addr: SocketAddr) -> Option<Client> {
        let removed = {
            let mut state = self.state.lock();
            let removed = Self::unlink(&mut state, addr);
            state.reconnect_pending.remove(&addr.to_string());
            removed
        };
        if removed.is_some() {
            self.scheduler.cancel(&addr.to_string());
        }
        removed
    }

    fn unlink(state: &mut RegistryState, addr: SocketAddr) -> Option<Client> {
        let client = state.by_addr.remove(&addr)?;
        if let Some(group) = state.group_of.remove(&addr) {
            if let Some(members) = state.by_group.get_mut(&group.id) {
                members.retain(|member| member.remote_addr() != addr);
                if members.is_empty() {
                    state.by_group.remove(&group.id);
                }
            }
        }
        Some(client)
    }

    /// Client tracked at `addr`.
    pub fn get(&self, addr: SocketAddr) -> Option<Client> {
        self.state.lock().by_addr.get(&addr).cloned()
    }

    /// Group of the client tracked at `addr`.
    pub fn group_of(&self, addr: SocketAddr) -> Option<ClientGroup> {
        self.state.lock().group_of.get(&addr).cloned()
    }

    /// Open members of `group_id` for which `exclude` returns `false`.
    pub fn find_clients<F>(&self, group_id: &str, exclude: F) -> Vec<Client>
    where
        F: Fn(&Client) -> bool,
    {
        let state = self.state.lock();
        state
            .by_group
            .get(group_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|client| !client.is_closed() && !exclude(client))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.state.lock().by_addr.len()
    }

    /// Whether no client is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allow the client at `addr` to be handed to the scheduler again,
    /// typically after its previous episode was abandoned.
    ///
    /// Returns `true` if a flag was cleared.
    pub fn retry(&self, addr: SocketAddr) -> bool {
        self.state
            .lock()
            .reconnect_pending
            .remove(&addr.to_string())
    }

    /// Run one supervision pass. Returns the number of reconnects requested.
    pub fn supervise_once(&self) -> usize {
        self.drain_outcomes();

        let clients: Vec<Client> = self.state.lock().by_addr.values().cloned().collect();
        let mut requested = 0;

        for client in clients {
            let target = Reconnect::target(&client);

            if self.idle_eviction && !client.is_closed() && client.is_idle() {
                tracing::warn!(remote = %target, "Closing idle client");
                client.close();
            }

            if !client.is_closed() {
                self.state.lock().reconnect_pending.remove(&target);
                continue;
            }

            let first_time = self.state.lock().reconnect_pending.insert(target.clone());
            if !first_time {
                continue;
            }
            if self.scheduler.schedule(Arc::new(client)) {
                requested += 1;
                tracing::debug!(remote = %target, "Requested reconnect");
            } else {
                tracing::debug!(remote = %target, "Reconnect already in progress");
            }
        }

        requested
    }

    /// Clear the pending flag of every target reported as reconnected.
    fn drain_outcomes(&self) {
        let mut outcomes = self.outcomes.lock();
        loop {
            match outcomes.try_recv() {
                Ok(ReconnectOutcome::Succeeded { target, .. }) => {
                    self.state.lock().reconnect_pending.remove(&target);
                }
                Ok(ReconnectOutcome::Abandoned { .. }) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// Run [`ClientRegistry::supervise_once`] every `interval` until the
    /// registry is dropped.
    pub fn spawn_supervisor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.supervise_once();
            }
        })
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.len())
            .field("idle_eviction", &self.idle_eviction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::net::TcpListener;

    /// Listener that accepts forever and keeps every connection open.
    async fn peer() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    async fn connect(addr: SocketAddr, config: Config) -> Client {
        Client::builder(addr.to_string())
            .config(config)
            .connect()
            .await
            .unwrap()
    }

    fn registry(initial: Duration) -> ClientRegistry {
        ClientRegistry::new(Arc::new(ReconnectScheduler::new(initial, 5)))
    }

    #[tokio::test]
    async fn test_add_get_group_of() {
        let registry = registry(Duration::from_secs(60));
        let addr = peer().await;
        let client = connect(addr, Config::default()).await;

        registry.add(ClientGroup::new("quotes", "eu-1"), client);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(addr).unwrap().remote_addr(), addr);
        assert_eq!(registry.group_of(addr), Some(ClientGroup::new("quotes", "eu-1")));

        assert!(registry.remove(addr).is_some());
        assert!(registry.is_empty());
        assert!(registry.group_of(addr).is_none());
        assert!(registry.find_clients("quotes", |_| false).is_empty());
    }

    #[tokio::test]
    async fn test_find_clients_skips_closed_and_excluded() {
        let registry = registry(Duration::from_secs(60));
        let (a, b, c) = (peer().await, peer().await, peer().await);
        for addr in [a, b, c] {
            let client = connect(addr, Config::default()).await;
            registry.add(ClientGroup::new("g", addr.to_string()), client);
        }

        assert_eq!(registry.find_clients("g", |_| false).len(), 3);

        registry.get(b).unwrap().close();
        let live = registry.find_clients("g", |client| client.remote_addr() == c);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].remote_addr(), a);

        assert!(registry.find_clients("missing", |_| false).is_empty());
    }

    #[tokio::test]
    async fn test_one_reconnect_per_closure_episode() {
        let registry = registry(Duration::from_secs(60));
        let addr = peer().await;
        let client = connect(addr, Config::default()).await;
        registry.add(ClientGroup::new("g", "k"), client.clone());

        assert_eq!(registry.supervise_once(), 0);

        client.close();
        assert_eq!(registry.supervise_once(), 1);
        assert_eq!(registry.supervise_once(), 0);
        assert!(registry.scheduler().is_active(&addr.to_string()));

        // an explicit retry re-arms the flag, but the running task absorbs it
        assert!(registry.retry(addr));
        assert_eq!(registry.supervise_once(), 0);
        assert_eq!(registry.scheduler().active_count(), 1);

        // once the task is gone the next pass schedules again
        registry.scheduler().cancel(&addr.to_string());
        assert!(registry.retry(addr));
        assert_eq!(registry.supervise_once(), 1);
        assert_eq!(registry.scheduler().active_count(), 1);
    }

    #[tokio::test]
    async fn test_flag_cleared_after_recovery() {
        let registry = registry(Duration::from_millis(10));
        let mut outcomes = registry.scheduler().subscribe();
        let addr = peer().await;
        let client = connect(addr, Config::default()).await;
        registry.add(ClientGroup::new("g", "k"), client.clone());

        client.close();
        assert_eq!(registry.supervise_once(), 1);

        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome, ReconnectOutcome::Succeeded { attempts: 1, .. }));
        assert!(!client.is_closed());

        // the next closure is a new episode
        client.close();
        assert_eq!(registry.supervise_once(), 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_closes_and_reconnects() {
        let registry = registry(Duration::from_secs(60)).with_idle_eviction(true);
        let addr = peer().await;
        let config = Config::default().with_idle_duration(Duration::from_millis(20));
        let client = connect(addr, config).await;
        registry.add(ClientGroup::new("g", "k"), client.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.supervise_once(), 1);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_idle_ignored_without_eviction() {
        let registry = registry(Duration::from_secs(60));
        let addr = peer().await;
        let config = Config::default().with_idle_duration(Duration::from_millis(20));
        let client = connect(addr, config).await;
        registry.add(ClientGroup::new("g", "k"), client.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.supervise_once(), 0);
        assert!(!client.is_closed());
    }

    #[test]
    fn test_group_serde() {
        let group = ClientGroup::new("quotes", "eu-1");
        let json = serde_json::to_string(&group).unwrap();
        assert_eq!(json, r#"{"id":"quotes","key":"eu-1"}"#);
    }
}
