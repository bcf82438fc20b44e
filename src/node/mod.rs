//! Node Health Records
//!
//! Identity types for cluster members and the per-peer health record
//! (`NodeInfo`) that the failure detector ages over time.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bincode::{Decode, Encode};
use parking_lot::Mutex;

/// Logical identifier of a node, unique per running process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an id from the hostname plus a random suffix, so several
    /// nodes in one process never collide
    pub fn generate() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "node".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", host, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Transport-level address of a node
///
/// The format depends on the transport that produced it: `host:port` for
/// TCP, `mem:<n>` for the in-memory network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse as a socket address (TCP/UDP transports)
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.0.parse().ok()
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Health of a tracked peer. Death is not a health state: dead nodes are
/// moved out of the live view into the tombstone set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Normal,
    Suspect,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Normal => "normal",
            Health::Suspect => "suspect",
        }
    }
}

#[derive(Debug)]
struct HealthState {
    health: Health,
    last_touch: u64,
    touch_count: u64,
    /// Highest gossip heartbeat observed for this node
    version: u64,
}

/// Per-peer health record
///
/// Fields live behind a per-instance lock so that `touch`, `suspect` and
/// `check_state` can race with view-level reads without taking the view's
/// mutation lock.
#[derive(Debug)]
pub struct NodeInfo {
    node_id: NodeId,
    address: NodeAddress,
    state: Mutex<HealthState>,
}

impl NodeInfo {
    /// Create a record that has never been touched
    pub fn new(node_id: NodeId, address: NodeAddress) -> Self {
        Self {
            node_id,
            address,
            state: Mutex::new(HealthState {
                health: Health::Normal,
                last_touch: 0,
                touch_count: 0,
                version: 0,
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn health(&self) -> Health {
        self.state.lock().health
    }

    pub fn last_touch(&self) -> u64 {
        self.state.lock().last_touch
    }

    pub fn touch_count(&self) -> u64 {
        self.state.lock().touch_count
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Record fresh evidence of life
    pub fn touch(&self, clock: &dyn Clock) {
        let now = clock.now_millis();
        let mut state = self.state.lock();
        Self::touch_locked(&mut state, now);
    }

    fn touch_locked(state: &mut HealthState, now: u64) {
        state.last_touch = state.last_touch.max(now);
        state.touch_count = match state.touch_count {
            u64::MAX => 1,
            n => n + 1,
        };
    }

    pub fn suspect(&self) {
        self.state.lock().health = Health::Suspect;
    }

    /// Clear suspicion and touch; used when a suspect proves alive
    pub fn reset(&self, clock: &dyn Clock) {
        let now = clock.now_millis();
        let mut state = self.state.lock();
        state.health = Health::Normal;
        Self::touch_locked(&mut state, now);
    }

    /// Transition to `Suspect` once `heartbeat_timeout` has elapsed since the
    /// last touch, and return the resulting health.
    pub fn check_state(&self, heartbeat_timeout: Duration, clock: &dyn Clock) -> Health {
        let now = clock.now_millis();
        let mut state = self.state.lock();
        let idle = now.saturating_sub(state.last_touch);
        if idle >= heartbeat_timeout.as_millis() as u64 {
            state.health = Health::Suspect;
        }
        state.health
    }

    /// Record a gossip heartbeat version; returns true if it was newer than
    /// anything seen so far.
    pub fn observe_version(&self, version: u64) -> bool {
        let mut state = self.state.lock();
        if version > state.version {
            state.version = version;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock();
        NodeSnapshot {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            health: state.health,
            last_touch: state.last_touch,
            touch_count: state.touch_count,
            version: state.version,
        }
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.node_id == other.node_id
    }
}

impl Eq for NodeInfo {}

/// Point-in-time copy of a `NodeInfo`, handed to listeners and callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub address: NodeAddress,
    pub health: Health,
    pub last_touch: u64,
    pub touch_count: u64,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node() -> NodeInfo {
        NodeInfo::new(NodeId::from("n1"), NodeAddress::from("mem:1"))
    }

    #[test]
    fn test_touch_increments_count_and_time() {
        let clock = ManualClock::new(100);
        let info = node();

        info.touch(&clock);
        assert_eq!(info.touch_count(), 1);
        assert_eq!(info.last_touch(), 100);

        clock.advance(Duration::from_millis(50));
        info.touch(&clock);
        assert_eq!(info.touch_count(), 2);
        assert_eq!(info.last_touch(), 150);
    }

    #[test]
    fn test_last_touch_never_goes_backwards() {
        let clock = ManualClock::new(500);
        let info = node();
        info.touch(&clock);

        clock.set(200);
        info.touch(&clock);
        assert_eq!(info.last_touch(), 500);
    }

    #[test]
    fn test_touch_count_wraps_to_one() {
        let clock = ManualClock::new(0);
        let info = node();
        info.state.lock().touch_count = u64::MAX;
        info.touch(&clock);
        assert_eq!(info.touch_count(), 1);
    }

    #[test]
    fn test_suspect_is_idempotent() {
        let info = node();
        info.suspect();
        info.suspect();
        assert_eq!(info.health(), Health::Suspect);
    }

    #[test]
    fn test_reset_clears_suspicion() {
        let clock = ManualClock::new(10);
        let info = node();
        info.suspect();
        info.reset(&clock);
        assert_eq!(info.health(), Health::Normal);
        assert_eq!(info.touch_count(), 1);
    }

    #[test]
    fn test_observe_version_only_moves_forward() {
        let info = node();
        assert!(info.observe_version(3));
        assert!(!info.observe_version(3));
        assert!(!info.observe_version(1));
        assert!(info.observe_version(4));
        assert_eq!(info.version(), 4);
    }

    #[test]
    fn test_equality_by_id_and_address() {
        let a = NodeInfo::new(NodeId::from("n1"), NodeAddress::from("mem:1"));
        let b = NodeInfo::new(NodeId::from("n1"), NodeAddress::from("mem:1"));
        let c = NodeInfo::new(NodeId::from("n1"), NodeAddress::from("mem:2"));
        b.suspect();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    proptest! {
        #[test]
        fn suspicion_follows_heartbeat_timeout(
            timeout_ms in 1u64..10_000,
            idle_ms in 0u64..20_000,
        ) {
            let clock = ManualClock::new(1_000);
            let info = node();
            info.touch(&clock);
            clock.advance(Duration::from_millis(idle_ms));

            let health = info.check_state(Duration::from_millis(timeout_ms), &clock);
            if idle_ms >= timeout_ms {
                prop_assert_eq!(health, Health::Suspect);
            } else {
                prop_assert_eq!(health, Health::Normal);
            }
        }
    }
}
