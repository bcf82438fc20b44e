//! Failure Detector
//!
//! One scheduler task per channel drives three periodic rounds:
//!
//! - **control**: age every live peer; probe each suspect directly and
//!   through `health_check_delegate_count` random healthy delegates. Any
//!   positive answer clears suspicion, otherwise the peer is tombstoned.
//!   Expired tombstones are evicted afterwards.
//! - **gossip**: bump our heartbeat counter and send the view, in batches,
//!   to `gossip_node_count` random healthy peers.
//! - **auto-broadcast**: for clusters at or below the configured threshold,
//!   broadcast the full view to the domain instead.
//!
//! The controller only talks to the network through [`ControlLink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{join, join_all};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::ChannelConfig;
use crate::event::{DomainScope, RemoteEvent};
use crate::metrics::Metrics;
use crate::node::{Health, NodeAddress, NodeId, NodeInfo};
use crate::protocol::{
    from_bytes, to_bytes, ControlMessage, GossipEntry, SyncReply, SyncRequest, PROTOCOL_VERSION,
};
use crate::transport::TransportError;
use crate::view::View;


/// Narrow view of the network used by the failure detector
#[async_trait]
pub trait ControlLink: Send + Sync {
    /// Unicast a control message and wait for the reply
    async fn request(
        &self,
        addr: &NodeAddress,
        message: &ControlMessage,
        timeout: Duration,
    ) -> Result<Option<Bytes>, TransportError>;

    /// Fire-and-forget unicast of a control message
    async fn send(&self, addr: &NodeAddress, message: &ControlMessage) -> bool;

    /// Broadcast a control message to the local domain
    async fn broadcast(&self, message: &ControlMessage) -> Result<(), TransportError>;

    /// Hand an event to local async listeners
    fn deliver(&self, event: RemoteEvent);
}

/// Pick `count` distinct random elements
fn pick_random<T: Clone>(items: &[T], count: usize) -> Vec<T> {
    let mut rng = rand::thread_rng();
    items.choose_multiple(&mut rng, count).cloned().collect()
}

/// Uniform random duration in `[min, max]`
pub(crate) fn random_between(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

/// Periodic failure detection and membership dissemination
pub struct Controller {
    view: Arc<View>,
    link: Arc<dyn ControlLink>,
    config: Arc<ChannelConfig>,
    heartbeat: AtomicU64,
    metrics: Option<Arc<Metrics>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(view: Arc<View>, link: Arc<dyn ControlLink>, config: Arc<ChannelConfig>) -> Self {
        Self {
            view,
            link,
            config,
            heartbeat: AtomicU64::new(0),
            metrics: None,
            task: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Own heartbeat counter, advanced every gossip or broadcast round
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    fn next_heartbeat(&self) -> u64 {
        self.heartbeat.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Log the detector settings
    pub(crate) fn describe(&self) {
        info!(
            "Failure detector: heartbeat_timeout={:?} tick={:?} gossip={} every {:?} to {} peer(s)",
            self.config.heartbeat_timeout,
            self.config.control_interval,
            self.config.gossip_enabled,
            self.config.gossip_interval,
            self.config.gossip_node_count
        );
    }

    /// Spawn the scheduler after a random start delay. No-op if running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let this = self.clone();
        let delay = random_between(self.config.start_delay_min, self.config.start_delay_max);
        *task = Some(tokio::spawn(async move {
            debug!("Failure detector starting in {:?}", delay);
            tokio::time::sleep(delay).await;
            this.run().await;
        }));
    }

    /// Cancel the scheduler. Rounds in progress are abandoned.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Failure detector stopped");
        }
    }

    async fn run(&self) {
        let mut control = tokio::time::interval(self.config.control_interval);
        let mut gossip = tokio::time::interval(self.config.gossip_interval);
        let mut auto = tokio::time::interval(self.config.auto_broadcast_interval);
        for timer in [&mut control, &mut gossip, &mut auto] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = control.tick() => self.check_status().await,
                _ = gossip.tick() => self.gossip_round().await,
                _ = auto.tick() => self.auto_broadcast_round().await,
            }
        }
    }

    /// One control round: age, probe, tombstone, evict
    pub async fn check_status(&self) {
        let timeout = self.config.heartbeat_timeout;
        let clock = self.view.clock().clone();

        let suspects: Vec<Arc<NodeInfo>> = self
            .view
            .live_nodes()
            .into_iter()
            .filter(|node| node.check_state(timeout, clock.as_ref()) == Health::Suspect)
            .collect();

        if !suspects.is_empty() {
            debug!("Probing {} suspect node(s)", suspects.len());
            join_all(suspects.iter().map(|node| self.probe(node))).await;
        }

        let evicted = self
            .view
            .cleanup_dead_node_list(self.config.dead_node_grace_period);
        if evicted > 0 {
            debug!("Evicted {} expired tombstone(s)", evicted);
        }
    }

    /// Probe a suspect directly and through delegates, all concurrently
    async fn probe(&self, node: &Arc<NodeInfo>) {
        if let Some(m) = &self.metrics {
            m.probes_total.inc();
        }

        let timeout = self.config.health_check_delegate_timeout;
        let candidates: Vec<Arc<NodeInfo>> = self
            .view
            .normal_nodes()
            .into_iter()
            .filter(|n| n.node_id() != node.node_id())
            .collect();
        let delegates = pick_random(&candidates, self.config.health_check_delegate_count);

        let check = ControlMessage::SynchronousRequest(SyncRequest::HealthCheck {
            target: node.node_id().clone(),
            address: node.address().clone(),
        });
        let indirect = delegates.iter().map(|delegate| {
            let check = &check;
            async move {
                let reply = self.link.request(delegate.address(), check, timeout).await;
                matches!(decode_reply(reply), Some(SyncReply::Reachable(true)))
            }
        });

        let (direct, indirect) = join(self.ping(node.address(), timeout), join_all(indirect)).await;
        let confirmations = indirect.iter().filter(|ok| **ok).count();

        if direct || confirmations > 0 {
            debug!(
                "Suspect {} confirmed alive (direct={}, delegates={}/{})",
                node.node_id(),
                direct,
                confirmations,
                delegates.len()
            );
            node.reset(self.view.clock().as_ref());
            return;
        }

        // A heartbeat may have replaced or cleared the record while probing
        let current = self.view.get(node.node_id());
        let unchanged = current
            .as_ref()
            .map(|c| Arc::ptr_eq(c, node) && c.health() == Health::Suspect)
            .unwrap_or(false);
        if unchanged && self.view.remove_dead_node(node.node_id()) {
            warn!(
                "Node {} declared dead after {} delegate probe(s)",
                node.node_id(),
                delegates.len()
            );
            if let Some(m) = &self.metrics {
                m.nodes_declared_dead.inc();
            }
        }
    }

    /// Direct liveness probe
    async fn ping(&self, addr: &NodeAddress, timeout: Duration) -> bool {
        let ping = ControlMessage::SynchronousRequest(SyncRequest::Ping);
        let reply = self.link.request(addr, &ping, timeout).await;
        matches!(decode_reply(reply), Some(SyncReply::Pong))
    }

    /// Current view as gossip entries, split into batches
    fn entry_batches(&self) -> Vec<Vec<GossipEntry>> {
        let entries: Vec<GossipEntry> = self
            .view
            .live_nodes()
            .iter()
            .map(|info| GossipEntry {
                node_id: info.node_id().clone(),
                address: info.address().clone(),
                version: info.version(),
            })
            .collect();

        if entries.is_empty() {
            // Still carries our own heartbeat
            return vec![Vec::new()];
        }
        entries
            .chunks(self.config.control_batch_size.max(1))
            .map(|c| c.to_vec())
            .collect()
    }

    /// One gossip round
    pub async fn gossip_round(&self) {
        if !self.config.gossip_enabled {
            return;
        }

        let peers = pick_random(&self.view.normal_nodes(), self.config.gossip_node_count);
        if peers.is_empty() {
            return;
        }

        let heartbeat = self.next_heartbeat();
        let messages: Vec<ControlMessage> = self
            .entry_batches()
            .into_iter()
            .map(|entries| ControlMessage::GossipNotification {
                version: PROTOCOL_VERSION,
                heartbeat,
                entries,
            })
            .collect();

        let sends = peers.iter().flat_map(|peer| {
            messages
                .iter()
                .map(move |message| self.link.send(peer.address(), message))
        });
        let sent = join_all(sends).await.into_iter().filter(|ok| *ok).count();

        trace!("Gossip heartbeat {} sent {} batch(es)", heartbeat, sent);
        if let Some(m) = &self.metrics {
            m.gossip_sent.inc_by(sent as u64);
        }
    }

    /// One auto-broadcast round, for small clusters
    pub async fn auto_broadcast_round(&self) {
        let threshold = self.config.auto_broadcast_threshold;
        if !self.config.auto_broadcast_enabled || threshold == 0 {
            return;
        }
        if self.view.node_count() > threshold {
            return;
        }

        let heartbeat = self.next_heartbeat();
        for entries in self.entry_batches() {
            let message = ControlMessage::Notification {
                version: PROTOCOL_VERSION,
                heartbeat,
                entries,
            };
            if let Err(e) = self.link.broadcast(&message).await {
                debug!("Auto-broadcast failed: {}", e);
                return;
            }
        }
    }

    /// Send a control event to the given nodes in batches of
    /// `control_batch_size`. Ids without a known address are skipped.
    /// Returns the number of nodes the transport accepted the event for.
    pub async fn send_control(&self, node_ids: &[NodeId], name: &str, data: Bytes) -> usize {
        let message = ControlMessage::Event {
            name: name.to_string(),
            data: data.to_vec(),
        };

        let mut delivered = 0;
        for batch in node_ids.chunks(self.config.control_batch_size.max(1)) {
            let targets: Vec<NodeAddress> = batch
                .iter()
                .filter_map(|id| {
                    let addr = self.view.address_of(id);
                    if addr.is_none() {
                        debug!("No address for {}, skipping control '{}'", id, name);
                    }
                    addr
                })
                .collect();

            delivered += join_all(targets.iter().map(|addr| self.link.send(addr, &message)))
                .await
                .into_iter()
                .filter(|ok| *ok)
                .count();
        }
        delivered
    }

    /// Route an inbound async `CONTROL` event
    pub async fn handle_control(&self, event: RemoteEvent) {
        let message: ControlMessage = match from_bytes(&event.data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed control message from {}: {}", event.origin_node_id, e);
                return;
            }
        };
        trace!("Control {} from {}", message.type_name(), event.origin_node_id);

        match message {
            // Probes sent without waiting for a reply still count as a heartbeat
            ControlMessage::SynchronousRequest(request) => {
                let _ = self.on_synchronous_request(&event, request).await;
            }
            other => self.handle_async_message(&event, other),
        }
    }

    /// Route an inbound sync `CONTROL` event and produce the reply
    pub async fn handle_sync_control(&self, event: RemoteEvent) -> Option<Bytes> {
        match from_bytes::<ControlMessage>(&event.data) {
            Ok(ControlMessage::SynchronousRequest(request)) => {
                let reply = self.on_synchronous_request(&event, request).await;
                match to_bytes(&reply) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!("Failed to encode probe reply: {}", e);
                        None
                    }
                }
            }
            Ok(other) => {
                self.handle_async_message(&event, other);
                None
            }
            Err(e) => {
                warn!("Malformed control request from {}: {}", event.origin_node_id, e);
                None
            }
        }
    }

    fn handle_async_message(&self, event: &RemoteEvent, message: ControlMessage) {
        match message {
            ControlMessage::Notification {
                version,
                heartbeat,
                entries,
            } => self.on_notification(event, version, heartbeat, &entries),
            ControlMessage::GossipNotification {
                version,
                heartbeat,
                entries,
            } => self.on_gossip_notification(event, version, heartbeat, &entries),
            ControlMessage::Event { name, data } => self.on_event(event, name, data),
            ControlMessage::SynchronousRequest(_) => {}
        }
    }

    /// Full view broadcast by a peer
    pub fn on_notification(
        &self,
        event: &RemoteEvent,
        version: u8,
        heartbeat: u64,
        entries: &[GossipEntry],
    ) {
        self.merge(event, version, heartbeat, entries);
    }

    /// Partial view gossiped by a peer
    pub fn on_gossip_notification(
        &self,
        event: &RemoteEvent,
        version: u8,
        heartbeat: u64,
        entries: &[GossipEntry],
    ) {
        self.merge(event, version, heartbeat, entries);
    }

    fn merge(&self, event: &RemoteEvent, version: u8, heartbeat: u64, entries: &[GossipEntry]) {
        if version != PROTOCOL_VERSION {
            warn!(
                "Ignoring membership from {} with protocol version {} (expected {})",
                event.origin_node_id, version, PROTOCOL_VERSION
            );
            return;
        }

        // The sender itself is direct evidence
        if self
            .view
            .heartbeat(&event.origin_address, &event.origin_node_id)
            .is_ok()
        {
            if let Some(info) = self.view.get(&event.origin_node_id) {
                info.observe_version(heartbeat);
            }
        }

        for entry in entries {
            if entry.node_id == *self.view.self_id() || entry.node_id == event.origin_node_id {
                continue;
            }
            if let Err(e) = self.view.observe(&entry.address, &entry.node_id, entry.version) {
                debug!("Skipping gossip entry {}: {}", entry.node_id, e);
            }
        }
    }

    /// Answer a probe
    pub async fn on_synchronous_request(
        &self,
        event: &RemoteEvent,
        request: SyncRequest,
    ) -> SyncReply {
        match request {
            SyncRequest::Ping => {
                let _ = self
                    .view
                    .heartbeat(&event.origin_address, &event.origin_node_id);
                SyncReply::Pong
            }
            SyncRequest::HealthCheck { target, address } => {
                if target == *self.view.self_id() {
                    return SyncReply::Reachable(true);
                }
                let reachable = self
                    .ping(&address, self.config.health_check_delegate_timeout / 2)
                    .await;
                debug!(
                    "Health check of {} for {}: reachable={}",
                    target, event.origin_node_id, reachable
                );
                SyncReply::Reachable(reachable)
            }
        }
    }

    /// Redeliver a generic control event to local listeners as `name`
    pub fn on_event(&self, event: &RemoteEvent, name: String, data: Vec<u8>) {
        self.link.deliver(RemoteEvent::new(
            DomainScope::Unscoped,
            name,
            Bytes::from(data),
            event.origin_node_id.clone(),
            event.origin_address.clone(),
        ));
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_reply(reply: Result<Option<Bytes>, TransportError>) -> Option<SyncReply> {
    match reply {
        Ok(Some(bytes)) => from_bytes(&bytes).ok(),
        Ok(None) => None,
        Err(e) => {
            trace!("Probe failed: {}", e);
            None
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("self_id", self.view.self_id())
            .field("heartbeat", &self.heartbeat())
            .field("running", &self.is_running())
            .finish()
    }
}
