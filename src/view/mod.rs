//! Membership View
//!
//! Concurrent table of live peers plus a time-bounded tombstone set for
//! peers recently declared dead.
//!
//! All structural mutations go through one mutation lock. Listeners are
//! notified only after that lock is released, so a listener may call back
//! into the view from inside `on_up`/`on_down`/`on_left`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::node::{Clock, Health, NodeAddress, NodeId, NodeInfo, NodeSnapshot};

#[cfg(test)]
mod tests;

/// Errors returned by view operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    /// The local node tried to add itself as a peer
    SelfAddition(NodeId),
    /// Fewer peers than requested were known when the wait timed out
    AwaitTimeout { expected: usize, actual: usize },
    /// The view was shut down while waiting
    Interrupted,
    /// The view was shut down and accepts no more changes
    Closed,
}

impl fmt::Display for ViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewError::SelfAddition(id) => write!(f, "cannot add local node {} as a peer", id),
            ViewError::AwaitTimeout { expected, actual } => write!(
                f,
                "timed out waiting for {} peers ({} known)",
                expected, actual
            ),
            ViewError::Interrupted => write!(f, "interrupted while waiting for peers"),
            ViewError::Closed => write!(f, "view is shut down"),
        }
    }
}

impl std::error::Error for ViewError {}

/// Observer of membership changes
///
/// All methods default to no-ops. A panic inside a listener is caught and
/// logged; it never stops the remaining listeners.
pub trait ViewListener: Send + Sync {
    /// A peer joined the live view
    fn on_up(&self, _node: &NodeSnapshot) {}

    /// A peer was declared dead and tombstoned
    fn on_down(&self, _node: &NodeSnapshot) {}

    /// A peer departed gracefully
    fn on_left(&self, _node: &NodeSnapshot) {}
}

#[derive(Clone, Copy, Debug)]
enum Change {
    Up,
    Down,
    Left,
}

struct Tombstone {
    info: Arc<NodeInfo>,
    down_at: u64,
}

#[derive(Default)]
struct ViewState {
    live: AHashMap<NodeId, Arc<NodeInfo>>,
    dead: AHashMap<NodeId, Tombstone>,
}

/// Live membership table of one channel
pub struct View {
    self_id: NodeId,
    clock: Arc<dyn Clock>,
    state: Mutex<ViewState>,
    listeners: RwLock<Vec<Arc<dyn ViewListener>>>,
    peer_count: watch::Sender<usize>,
    closed: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl View {
    pub fn new(self_id: NodeId, clock: Arc<dyn Clock>) -> Self {
        let (peer_count, _) = watch::channel(0);
        Self {
            self_id,
            clock,
            state: Mutex::new(ViewState::default()),
            listeners: RwLock::new(Vec::new()),
            peer_count,
            closed: AtomicBool::new(false),
            metrics: None,
        }
    }

    /// Attach a metrics registry for node gauges
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn add_listener(&self, listener: Arc<dyn ViewListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ViewListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .write()
            .retain(|l| Arc::as_ptr(l) as *const () != target);
    }

    fn check_mutation(&self, node_id: &NodeId) -> Result<(), ViewError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ViewError::Closed);
        }
        if *node_id == self.self_id {
            return Err(ViewError::SelfAddition(node_id.clone()));
        }
        Ok(())
    }

    fn new_node(&self, address: &NodeAddress, node_id: &NodeId) -> Arc<NodeInfo> {
        let info = Arc::new(NodeInfo::new(node_id.clone(), address.clone()));
        info.touch(self.clock.as_ref());
        info
    }

    /// Add a newly discovered peer. Returns true when the peer was added.
    ///
    /// Tombstoned peers are rejected; only a heartbeat can bring them back.
    pub fn add_host(&self, address: &NodeAddress, node_id: &NodeId) -> Result<bool, ViewError> {
        self.check_mutation(node_id)?;

        let added = {
            let mut state = self.state.lock();
            let added = if state.dead.contains_key(node_id) {
                debug!("Rejecting re-add of dead node {} ({})", node_id, address);
                None
            } else if state.live.contains_key(node_id) {
                None
            } else {
                let info = self.new_node(address, node_id);
                state.live.insert(node_id.clone(), info.clone());
                Some(info)
            };
            self.committed(&state);
            added
        };

        Ok(match added {
            Some(info) => {
                info!("Node {} ({}) is up", node_id, address);
                self.notify(Change::Up, &info.snapshot());
                true
            }
            None => false,
        })
    }

    /// Record a direct heartbeat from a peer. Returns true when the peer was
    /// newly added (including resurrection of a tombstoned peer).
    pub fn heartbeat(&self, address: &NodeAddress, node_id: &NodeId) -> Result<bool, ViewError> {
        self.check_mutation(node_id)?;

        let added = {
            let mut state = self.state.lock();
            if state.dead.remove(node_id).is_some() {
                info!("Dead node {} ({}) is alive again", node_id, address);
            }
            let added = match state.live.get(node_id) {
                Some(info) if info.address() == address => {
                    info.reset(self.clock.as_ref());
                    None
                }
                Some(_) => {
                    debug!("Node {} moved to {}", node_id, address);
                    let info = self.new_node(address, node_id);
                    state.live.insert(node_id.clone(), info);
                    None
                }
                None => {
                    let info = self.new_node(address, node_id);
                    state.live.insert(node_id.clone(), info.clone());
                    Some(info)
                }
            };
            self.committed(&state);
            added
        };

        Ok(match added {
            Some(info) => {
                info!("Node {} ({}) is up", node_id, address);
                self.notify(Change::Up, &info.snapshot());
                true
            }
            None => false,
        })
    }

    /// Merge second-hand gossip about a peer carrying heartbeat `version`.
    ///
    /// Known peers are only refreshed by a newer version; tombstones are
    /// only lifted by a version newer than the one they died with. Returns
    /// true when the peer was newly added.
    pub fn observe(
        &self,
        address: &NodeAddress,
        node_id: &NodeId,
        version: u64,
    ) -> Result<bool, ViewError> {
        self.check_mutation(node_id)?;

        let added = {
            let mut state = self.state.lock();
            let stale_tombstone = state
                .dead
                .get(node_id)
                .map(|t| version <= t.info.version());
            let added = match stale_tombstone {
                Some(true) => None,
                Some(false) => {
                    state.dead.remove(node_id);
                    let info = self.new_node(address, node_id);
                    info.observe_version(version);
                    state.live.insert(node_id.clone(), info.clone());
                    Some(info)
                }
                None => match state.live.get(node_id) {
                    Some(info) => {
                        if info.observe_version(version) {
                            info.reset(self.clock.as_ref());
                        }
                        None
                    }
                    None => {
                        let info = self.new_node(address, node_id);
                        info.observe_version(version);
                        state.live.insert(node_id.clone(), info.clone());
                        Some(info)
                    }
                },
            };
            self.committed(&state);
            added
        };

        Ok(match added {
            Some(info) => {
                info!("Node {} ({}) is up (gossip v{})", node_id, address, version);
                self.notify(Change::Up, &info.snapshot());
                true
            }
            None => false,
        })
    }

    /// Move a peer from the live view to the tombstone set
    pub fn remove_dead_node(&self, node_id: &NodeId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.live.remove(node_id).map(|info| {
                let down_at = self.clock.now_millis();
                state.dead.insert(
                    node_id.clone(),
                    Tombstone {
                        info: info.clone(),
                        down_at,
                    },
                );
                info
            });
            self.committed(&state);
            removed
        };

        match removed {
            Some(info) => {
                warn!("Node {} ({}) is down", node_id, info.address());
                self.notify(Change::Down, &info.snapshot());
                true
            }
            None => false,
        }
    }

    /// Remove a gracefully departing peer without tombstoning it
    pub fn remove_leaving_node(&self, node_id: &NodeId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.live.remove(node_id);
            self.committed(&state);
            removed
        };

        match removed {
            Some(info) => {
                info!("Node {} ({}) left", node_id, info.address());
                self.notify(Change::Left, &info.snapshot());
                true
            }
            None => false,
        }
    }

    /// Drop every peer and tombstone, notifying "left" for each live peer
    pub fn clear(&self) -> usize {
        let removed: Vec<Arc<NodeInfo>> = {
            let mut state = self.state.lock();
            state.dead.clear();
            let removed: Vec<Arc<NodeInfo>> = state.live.drain().map(|(_, info)| info).collect();
            self.committed(&state);
            removed
        };

        for info in &removed {
            self.notify(Change::Left, &info.snapshot());
        }
        removed.len()
    }

    /// Evict tombstones whose grace period has elapsed
    pub fn cleanup_dead_node_list(&self, grace_period: Duration) -> usize {
        let now = self.clock.now_millis();
        let grace = grace_period.as_millis() as u64;

        let mut state = self.state.lock();
        let before = state.dead.len();
        state.dead.retain(|id, tomb| {
            let keep = now < tomb.down_at.saturating_add(grace);
            if !keep {
                debug!("Tombstone for {} expired", id);
            }
            keep
        });
        let evicted = before - state.dead.len();
        if evicted > 0 {
            self.committed(&state);
        }
        evicted
    }

    /// Wait until at least `minimum` peers (at least one) are live.
    ///
    /// Fails with `AwaitTimeout` if fewer than `minimum` peers are known
    /// once `timeout` elapses.
    pub async fn await_peers(&self, timeout: Duration, minimum: usize) -> Result<usize, ViewError> {
        let minimum = minimum.max(1);
        let mut rx = self.peer_count.subscribe();

        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|n| *n >= minimum || self.closed.load(Ordering::Acquire)),
        )
        .await;

        match waited {
            Ok(Ok(_)) if self.closed.load(Ordering::Acquire) => Err(ViewError::Interrupted),
            Ok(Ok(n)) => Ok(*n),
            Ok(Err(_)) => Err(ViewError::Interrupted),
            Err(_) => Err(ViewError::AwaitTimeout {
                expected: minimum,
                actual: self.node_count(),
            }),
        }
    }

    /// Wake every `await_peers` caller with `Interrupted`
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.peer_count.send_modify(|_| {});
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn dead_count(&self) -> usize {
        self.state.lock().dead.len()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<NodeInfo>> {
        self.state.lock().live.get(node_id).cloned()
    }

    pub fn address_of(&self, node_id: &NodeId) -> Option<NodeAddress> {
        self.state
            .lock()
            .live
            .get(node_id)
            .map(|info| info.address().clone())
    }

    pub fn is_live(&self, node_id: &NodeId) -> bool {
        self.state.lock().live.contains_key(node_id)
    }

    pub fn is_node_dead(&self, node_id: &NodeId) -> bool {
        self.state.lock().dead.contains_key(node_id)
    }

    /// Live records, for the failure detector to age
    pub fn live_nodes(&self) -> Vec<Arc<NodeInfo>> {
        self.state.lock().live.values().cloned().collect()
    }

    /// Live peers currently in `Normal` health
    pub fn normal_nodes(&self) -> Vec<Arc<NodeInfo>> {
        self.live_nodes()
            .into_iter()
            .filter(|info| info.health() == Health::Normal)
            .collect()
    }

    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.live_nodes().iter().map(|info| info.snapshot()).collect()
    }

    /// Live peers, stalest first
    pub fn nodes_by_staleness(&self) -> Vec<NodeSnapshot> {
        let mut nodes = self.nodes();
        nodes.sort_by_key(|n| n.last_touch);
        nodes
    }

    /// Publish counts after a mutation, still holding the mutation lock so
    /// concurrent mutations publish in commit order
    fn committed(&self, state: &ViewState) {
        let (live, dead) = (state.live.len(), state.dead.len());
        self.peer_count.send_replace(live);
        if let Some(metrics) = &self.metrics {
            metrics.nodes_live.set(live as i64);
            metrics.nodes_dead.set(dead as i64);
        }
    }

    fn notify(&self, change: Change, node: &NodeSnapshot) {
        let listeners: Vec<Arc<dyn ViewListener>> = self.listeners.read().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| match change {
                Change::Up => listener.on_up(node),
                Change::Down => listener.on_down(node),
                Change::Left => listener.on_left(node),
            }));
            if result.is_err() {
                error!(
                    "View listener panicked handling {:?} for node {}",
                    change, node.node_id
                );
            }
        }
    }
}
