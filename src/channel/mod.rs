//! Channel
//!
//! One node's membership in a domain. A channel owns the view, the event
//! consumer, the failure detector and both transports, and runs the
//! discovery protocol on top of them:
//!
//! - [`Channel::resync`] broadcasts `PUBLISH` a bounded number of times,
//!   spaced by a random interval.
//! - A node receiving `PUBLISH` adds the publisher and unicasts `DISCOVER`
//!   back, so both sides learn of each other.
//! - `FORCE_RESYNC` asks all (or the listed) receivers to publish again.
//! - `SHUTDOWN` and `LEAVE` remove the sender from receivers' views.
//!
//! Lifecycle is created -> started -> closed; a closed channel stays closed.

mod link;
mod registry;

#[cfg(test)]
mod tests;

pub use registry::ChannelRegistry;

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ChannelConfig, ConfigError};
use crate::consumer::{AsyncListener, ConsumerError, EventConsumer, ListenerId, SyncListener};
use crate::controller::{random_between, Controller};
use crate::event::{DomainScope, RemoteEvent};
use crate::metrics::Metrics;
use crate::node::{Clock, NodeAddress, NodeId, NodeSnapshot, SystemClock};
use crate::pool::{PoolError, WorkerPool};
use crate::protocol::{
    from_bytes, to_bytes, Announce, ForceResync, CONTROL, DISCOVER, FORCE_RESYNC, LEAVE,
    PROTOCOL_TYPES, PUBLISH, SHUTDOWN,
};
use crate::response::{RespList, Response};
use crate::transport::{
    BroadcastTransport, ConnectionListener, InboundHandler, TransportError, TransportFactory,
    UnicastTransport,
};
use crate::view::{View, ViewError, ViewListener};

use link::{Identity, Link};

/// Channel error types
#[derive(Debug)]
pub enum ChannelError {
    /// Operation requires a started channel
    NotStarted,
    /// The channel has been closed
    Closed,
    Config(ConfigError),
    View(ViewError),
    Consumer(ConsumerError),
    Transport(TransportError),
    Encode(bincode::error::EncodeError),
    Decode(bincode::error::DecodeError),
    /// The outbound work queue refused the job
    Pool(PoolError),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::NotStarted => write!(f, "channel is not started"),
            ChannelError::Closed => write!(f, "channel is closed"),
            ChannelError::Config(e) => write!(f, "{}", e),
            ChannelError::View(e) => write!(f, "view error: {}", e),
            ChannelError::Consumer(e) => write!(f, "consumer error: {}", e),
            ChannelError::Transport(e) => write!(f, "transport error: {}", e),
            ChannelError::Encode(e) => write!(f, "encode error: {}", e),
            ChannelError::Decode(e) => write!(f, "decode error: {}", e),
            ChannelError::Pool(e) => write!(f, "dispatch rejected: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<ConfigError> for ChannelError {
    fn from(e: ConfigError) -> Self {
        ChannelError::Config(e)
    }
}

impl From<ViewError> for ChannelError {
    fn from(e: ViewError) -> Self {
        ChannelError::View(e)
    }
}

impl From<ConsumerError> for ChannelError {
    fn from(e: ConsumerError) -> Self {
        ChannelError::Consumer(e)
    }
}

impl From<TransportError> for ChannelError {
    fn from(e: TransportError) -> Self {
        ChannelError::Transport(e)
    }
}

impl From<bincode::error::EncodeError> for ChannelError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ChannelError::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for ChannelError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ChannelError::Decode(e)
    }
}

impl From<PoolError> for ChannelError {
    fn from(e: PoolError) -> Self {
        ChannelError::Pool(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Started,
    Closed,
}

/// Observer of peers found by the discovery protocol
pub trait DiscoveryListener: Send + Sync {
    fn on_discovered(&self, node_id: &NodeId, address: &NodeAddress);
}

/// Completion of a fire-and-forget dispatch.
///
/// Resolves once the transport accepted (or rejected) the event. It says
/// nothing about whether any peer received it. Dropping the handle does not
/// cancel the dispatch.
#[must_use = "dropping the handle ignores the dispatch outcome"]
pub struct DispatchHandle {
    rx: oneshot::Receiver<Result<(), ChannelError>>,
}

impl DispatchHandle {
    fn ready(result: Result<(), ChannelError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for DispatchHandle {
    type Output = Result<(), ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Worker aborted by close()
            Poll::Ready(Err(_)) => Poll::Ready(Err(ChannelError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Cluster membership and event dispatch for one node
pub struct Channel {
    config: Arc<ChannelConfig>,
    identity: Arc<Identity>,
    state: Mutex<ChannelState>,
    view: Arc<View>,
    consumer: Arc<EventConsumer>,
    controller: Arc<Controller>,
    broadcast: Arc<dyn BroadcastTransport>,
    unicast: Arc<dyn UnicastTransport>,
    publisher: Mutex<Option<Arc<WorkerPool>>>,
    resync_task: Mutex<Option<JoinHandle<()>>>,
    protocol_listeners: Mutex<Vec<ListenerId>>,
    discovery_listeners: RwLock<Vec<Arc<dyn DiscoveryListener>>>,
    registry: Mutex<Weak<ChannelRegistry>>,
    metrics: Arc<Metrics>,
}

impl Channel {
    /// Build a channel from configuration. Nothing touches the network
    /// until [`Channel::start`].
    pub fn new(
        config: ChannelConfig,
        transports: &TransportFactory,
    ) -> Result<Arc<Self>, ChannelError> {
        Self::with_clock(config, transports, Arc::new(SystemClock::new()))
    }

    /// Build a channel whose health bookkeeping uses `clock`
    pub fn with_clock(
        config: ChannelConfig,
        transports: &TransportFactory,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ChannelError> {
        config.validate()?;
        let config = Arc::new(config);
        let node_id = config.resolve_node_id();
        let metrics = Arc::new(Metrics::new());

        let view = Arc::new(View::new(node_id.clone(), clock).with_metrics(metrics.clone()));
        let consumer = Arc::new(
            EventConsumer::new(node_id.clone(), config.domain.clone())
                .with_metrics(metrics.clone()),
        );
        let broadcast = transports.broadcast(&config)?;
        let unicast = transports.unicast(&config)?;

        let identity = Arc::new(Identity::new(node_id, config.domain.clone()));
        let link = Arc::new(Link::new(
            identity.clone(),
            unicast.clone(),
            broadcast.clone(),
            consumer.clone(),
        ));
        let controller = Arc::new(
            Controller::new(view.clone(), link, config.clone()).with_metrics(metrics.clone()),
        );

        Ok(Arc::new(Self {
            config,
            identity,
            state: Mutex::new(ChannelState::Created),
            view,
            consumer,
            controller,
            broadcast,
            unicast,
            publisher: Mutex::new(None),
            resync_task: Mutex::new(None),
            protocol_listeners: Mutex::new(Vec::new()),
            discovery_listeners: RwLock::new(Vec::new()),
            registry: Mutex::new(Weak::new()),
            metrics,
        }))
    }

    pub fn self_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    /// Own unicast address, once started
    pub fn self_address(&self) -> Option<NodeAddress> {
        self.identity.address.read().clone()
    }

    pub fn domain(&self) -> String {
        self.identity.domain()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_started(&self) -> bool {
        self.state() == ChannelState::Started
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    fn ensure_started(&self) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Started => Ok(()),
            ChannelState::Created => Err(ChannelError::NotStarted),
            ChannelState::Closed => Err(ChannelError::Closed),
        }
    }

    /// Start the pools, transports and failure detector. Calling it on a
    /// started channel is a no-op.
    ///
    /// A failed start leaves the channel closed.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        {
            let mut state = self.state.lock();
            match *state {
                ChannelState::Started => return Ok(()),
                ChannelState::Closed => return Err(ChannelError::Closed),
                ChannelState::Created => *state = ChannelState::Started,
            }
        }

        if let Err(e) = self.start_components().await {
            error!("Channel {} failed to start: {}", self.self_id(), e);
            *self.state.lock() = ChannelState::Closed;
            self.teardown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_components(self: &Arc<Self>) -> Result<(), ChannelError> {
        let config = &self.config;
        self.consumer
            .start(config.consumer_workers, config.consumer_queue_capacity)?;
        let pool = WorkerPool::new(
            "publisher",
            config.publish_workers,
            config.publish_queue_capacity,
        );
        *self.publisher.lock() = Some(Arc::new(pool));
        self.register_protocol_listeners()?;

        let inbound: Arc<dyn InboundHandler> = self.consumer.clone();
        let address = self.unicast.start(inbound.clone()).await?;
        *self.identity.address.write() = Some(address.clone());

        // The broadcast transport reports `connected` from start(), which
        // runs the first resync
        self.broadcast
            .add_connection_listener(Arc::new(ResyncOnConnect {
                channel: Arc::downgrade(self),
            }));
        self.broadcast.start(inbound).await?;

        self.controller.describe();
        self.controller.start();

        info!(
            "Channel {} started in domain '{}' at {} (broadcast: {}, unicast: {})",
            self.self_id(),
            self.domain(),
            address,
            self.broadcast.kind(),
            self.unicast.kind()
        );
        Ok(())
    }

    fn register_protocol_listeners(self: &Arc<Self>) -> Result<(), ChannelError> {
        let handler = Arc::new(ProtocolListener {
            channel: Arc::downgrade(self),
        });

        let mut ids = self.protocol_listeners.lock();
        for event_type in PROTOCOL_TYPES {
            ids.push(self.consumer.register_async(event_type, handler.clone())?);
        }
        ids.push(self.consumer.register_sync(CONTROL, handler)?);
        Ok(())
    }

    /// Close the channel: announce `SHUTDOWN`, then stop everything.
    /// No-op unless started.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Started {
                return;
            }
            *state = ChannelState::Closed;
        }

        let scope = DomainScope::named(self.domain());
        if let Err(e) = self.broadcast_event(scope, SHUTDOWN, Bytes::new()).await {
            debug!("Shutdown announcement failed: {}", e);
        }

        self.teardown().await;

        let registry = self.registry.lock().upgrade();
        if let Some(registry) = registry {
            registry.unregister(self);
        }
        info!("Channel {} closed", self.self_id());
    }

    /// Pending work is dropped, not drained
    async fn teardown(&self) {
        let resync = self.resync_task.lock().take();
        if let Some(task) = resync {
            task.abort();
        }
        self.controller.stop();
        self.consumer.stop();
        let publisher = self.publisher.lock().take();
        if let Some(pool) = publisher {
            pool.shutdown();
        }
        let listeners = std::mem::take(&mut *self.protocol_listeners.lock());
        for id in listeners {
            self.consumer.unregister(id);
        }
        self.view.shutdown();

        self.broadcast.close().await;
        self.unicast.close().await;
    }

    /// Announce ourselves to the domain, up to `publish_max_attempts`
    /// times. Replaces any announcement still in progress.
    pub fn resync(self: &Arc<Self>) {
        if !self.is_started() {
            return;
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.publish_rounds().await });
        let previous = self.resync_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn publish_rounds(&self) {
        let mut remaining = self.config.publish_max_attempts;
        while remaining > 0 {
            remaining -= 1;
            if let Err(e) = self.publish_self().await {
                debug!("Publish failed ({} attempt(s) left): {}", remaining, e);
            }
            if remaining > 0 {
                let pause = random_between(
                    self.config.publish_interval_min,
                    self.config.publish_interval_max,
                );
                tokio::time::sleep(pause).await;
            }
        }
    }

    async fn publish_self(&self) -> Result<(), ChannelError> {
        let body = to_bytes(&Announce {
            address: self.identity.address()?,
        })?;
        trace!("Publishing {} to '{}'", self.self_id(), self.domain());
        self.broadcast_event(DomainScope::named(self.domain()), PUBLISH, body)
            .await
    }

    /// Ask the domain to re-run discovery. `None` targets every receiver,
    /// otherwise only the listed nodes honor it.
    pub async fn force_resync_of(&self, targets: Option<Vec<NodeId>>) -> Result<(), ChannelError> {
        self.ensure_started()?;
        let body = to_bytes(&ForceResync { targets })?;
        self.broadcast_event(DomainScope::named(self.domain()), FORCE_RESYNC, body)
            .await
    }

    /// Move this node to another domain: leave the old one, forget its
    /// peers and discover the new one.
    pub async fn change_domain(
        self: &Arc<Self>,
        domain: impl Into<String>,
    ) -> Result<(), ChannelError> {
        let domain = domain.into();
        self.ensure_started()?;
        let old = self.domain();
        if old == domain {
            return Ok(());
        }

        let registry = self.registry.lock().upgrade();
        if let Some(registry) = &registry {
            registry.unregister(self);
        }

        if let Err(e) = self
            .broadcast_event(DomainScope::named(old.clone()), LEAVE, Bytes::new())
            .await
        {
            warn!("Failed to announce leaving '{}': {}", old, e);
        }
        let left = self.view.clear();

        *self.identity.domain.write() = domain.clone();
        self.consumer.change_domain(domain.clone());

        if let Some(registry) = &registry {
            registry.register(self);
        }
        info!(
            "Channel {} moved from '{}' to '{}', {} peer(s) left behind",
            self.self_id(),
            old,
            domain,
            left
        );
        self.resync();
        Ok(())
    }

    async fn broadcast_event(
        &self,
        scope: DomainScope,
        event_type: &str,
        data: Bytes,
    ) -> Result<(), ChannelError> {
        let event = self.identity.event(scope, event_type, data)?;
        self.broadcast.dispatch(event).await?;
        Ok(())
    }

    fn outbound_event(
        &self,
        scope: DomainScope,
        event_type: &str,
        data: Bytes,
    ) -> Result<RemoteEvent, ChannelError> {
        self.ensure_started()?;
        Ok(self.identity.event(scope, event_type, data)?)
    }

    // Dispatch

    /// Broadcast to our own domain
    pub fn dispatch(&self, event_type: &str, data: Bytes) -> DispatchHandle {
        self.dispatch_scoped(DomainScope::named(self.domain()), event_type, data)
    }

    /// Broadcast to one named domain
    pub fn dispatch_to_domain(
        &self,
        domain: &str,
        event_type: &str,
        data: Bytes,
    ) -> DispatchHandle {
        self.dispatch_scoped(DomainScope::named(domain), event_type, data)
    }

    /// Broadcast to every domain
    pub fn dispatch_all_domains(&self, event_type: &str, data: Bytes) -> DispatchHandle {
        self.dispatch_scoped(DomainScope::All, event_type, data)
    }

    fn dispatch_scoped(&self, scope: DomainScope, event_type: &str, data: Bytes) -> DispatchHandle {
        let event = match self.outbound_event(scope, event_type, data) {
            Ok(event) => event,
            Err(e) => return DispatchHandle::ready(Err(e)),
        };
        let broadcast = self.broadcast.clone();
        self.submit(async move {
            broadcast.dispatch(event).await?;
            Ok(())
        })
    }

    /// Fire-and-forget unicast
    pub fn dispatch_to(&self, addr: &NodeAddress, event_type: &str, data: Bytes) -> DispatchHandle {
        let event = match self.outbound_event(DomainScope::Unscoped, event_type, data) {
            Ok(event) => event,
            Err(e) => return DispatchHandle::ready(Err(e)),
        };
        let unicast = self.unicast.clone();
        let addr = addr.clone();
        self.submit(async move {
            if unicast.dispatch(&addr, event).await {
                Ok(())
            } else {
                Err(ChannelError::Transport(TransportError::Unreachable(
                    addr.to_string(),
                )))
            }
        })
    }

    fn submit<F>(&self, job: F) -> DispatchHandle
    where
        F: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        let Some(pool) = self.publisher.lock().clone() else {
            return DispatchHandle::ready(Err(ChannelError::NotStarted));
        };

        let (tx, rx) = oneshot::channel();
        let metrics = self.metrics.clone();
        let work = async move {
            let result = job.await;
            if let Err(e) = &result {
                debug!("Dispatch failed: {}", e);
                metrics.dispatch_failures.inc();
            }
            let _ = tx.send(result);
        };

        match pool.submit(work) {
            Ok(()) => DispatchHandle { rx },
            Err(e) => {
                warn!("Dropping outbound dispatch: {}", e);
                self.metrics.dispatch_failures.inc();
                DispatchHandle::ready(Err(ChannelError::Pool(e)))
            }
        }
    }

    // Synchronous sends

    /// Send to one peer and wait for its reply
    pub async fn send(
        &self,
        addr: &NodeAddress,
        event_type: &str,
        data: Bytes,
        timeout: Duration,
    ) -> Result<Response, ChannelError> {
        let event = self.outbound_event(DomainScope::Unscoped, event_type, data)?;
        Ok(self.unicast.send(addr, event, timeout).await)
    }

    /// Send the same payload to every address concurrently. One response
    /// per address, in the order given.
    pub async fn send_many(
        &self,
        addrs: &[NodeAddress],
        event_type: &str,
        data: Bytes,
        timeout: Duration,
    ) -> Result<RespList, ChannelError> {
        let event = self.outbound_event(DomainScope::Unscoped, event_type, data)?;
        Ok(self.unicast.send_many(addrs, event, timeout).await)
    }

    /// Send a distinct payload to each address concurrently
    pub async fn send_each(
        &self,
        targets: Vec<(NodeAddress, Bytes)>,
        event_type: &str,
        timeout: Duration,
    ) -> Result<RespList, ChannelError> {
        let mut events = Vec::with_capacity(targets.len());
        for (addr, data) in targets {
            events.push((addr, self.outbound_event(DomainScope::Unscoped, event_type, data)?));
        }
        Ok(self.unicast.send_each(events, timeout).await)
    }

    /// Like [`Channel::send_many`], addressed by node id. Ids without a
    /// known address are skipped and absent from the result.
    pub async fn send_to_nodes(
        &self,
        node_ids: &[NodeId],
        event_type: &str,
        data: Bytes,
        timeout: Duration,
    ) -> Result<RespList, ChannelError> {
        let addrs: Vec<NodeAddress> = node_ids
            .iter()
            .filter_map(|id| {
                let addr = self.view.address_of(id);
                if addr.is_none() {
                    debug!("No address for {}, skipping '{}'", id, event_type);
                }
                addr
            })
            .collect();
        self.send_many(&addrs, event_type, data, timeout).await
    }

    /// Send a control event to the given nodes in batches. Returns how many
    /// nodes the transport accepted it for.
    pub async fn send_control(
        &self,
        node_ids: &[NodeId],
        name: &str,
        data: Bytes,
    ) -> Result<usize, ChannelError> {
        self.ensure_started()?;
        Ok(self.controller.send_control(node_ids, name, data).await)
    }

    // Listeners

    /// Add an async listener; fails once the channel is closed
    pub fn register_async(
        &self,
        event_type: impl Into<String>,
        listener: Arc<dyn AsyncListener>,
    ) -> Result<ListenerId, ChannelError> {
        Ok(self.consumer.register_async(event_type, listener)?)
    }

    /// Register the single sync listener for `event_type`
    pub fn register_sync(
        &self,
        event_type: impl Into<String>,
        listener: Arc<dyn SyncListener>,
    ) -> Result<ListenerId, ChannelError> {
        Ok(self.consumer.register_sync(event_type, listener)?)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.consumer.unregister(id)
    }

    pub fn add_view_listener(&self, listener: Arc<dyn ViewListener>) {
        self.view.add_listener(listener);
    }

    pub fn remove_view_listener(&self, listener: &Arc<dyn ViewListener>) {
        self.view.remove_listener(listener);
    }

    pub fn add_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        self.discovery_listeners.write().push(listener);
    }

    // Membership queries

    /// Wait until at least `minimum` peers are live
    pub async fn await_peers(
        &self,
        timeout: Duration,
        minimum: usize,
    ) -> Result<usize, ChannelError> {
        Ok(self.view.await_peers(timeout, minimum).await?)
    }

    pub fn node_count(&self) -> usize {
        self.view.node_count()
    }

    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.view.nodes()
    }

    pub fn is_node_dead(&self, node_id: &NodeId) -> bool {
        self.view.is_node_dead(node_id)
    }

    // Inbound protocol

    async fn on_protocol_event(self: &Arc<Self>, event: RemoteEvent) {
        match event.event_type.as_str() {
            PUBLISH => self.on_publish(event).await,
            DISCOVER => self.on_discover(event),
            FORCE_RESYNC => self.on_force_resync(event),
            SHUTDOWN | LEAVE => self.on_leave(event),
            CONTROL => self.controller.handle_control(event).await,
            other => debug!("Unexpected protocol event '{}'", other),
        }
    }

    async fn on_publish(&self, event: RemoteEvent) {
        let Some(announce) = decode::<Announce>(&event) else {
            return;
        };
        let peer = &event.origin_node_id;
        match self.view.add_host(&announce.address, peer) {
            Err(e) => {
                warn!("Ignoring publish from {}: {}", peer, e);
                return;
            }
            Ok(false) if self.view.is_node_dead(peer) => {
                debug!("Ignoring publish from dead node {}", peer);
                return;
            }
            Ok(false) => {
                // Known peer: the announcement counts as a heartbeat
                if let Err(e) = self.view.heartbeat(&announce.address, peer) {
                    debug!("Publish from {} not recorded: {}", peer, e);
                }
            }
            Ok(true) => {}
        }

        match self.discover_reply() {
            Ok(reply) => {
                if !self.unicast.dispatch(&announce.address, reply).await {
                    debug!("Discover reply to {} ({}) failed", peer, announce.address);
                }
            }
            Err(e) => debug!("Cannot answer publish from {}: {}", peer, e),
        }
        self.notify_discovered(peer, &announce.address);
    }

    fn discover_reply(&self) -> Result<RemoteEvent, ChannelError> {
        let body = to_bytes(&Announce {
            address: self.identity.address()?,
        })?;
        Ok(self.identity.event(DomainScope::Unscoped, DISCOVER, body)?)
    }

    fn on_discover(&self, event: RemoteEvent) {
        let Some(announce) = decode::<Announce>(&event) else {
            return;
        };
        match self.view.add_host(&announce.address, &event.origin_node_id) {
            Ok(true) => self.notify_discovered(&event.origin_node_id, &announce.address),
            Ok(false) => trace!("Already knew (or buried) {}", event.origin_node_id),
            Err(e) => warn!("Ignoring discover from {}: {}", event.origin_node_id, e),
        }
    }

    fn on_force_resync(self: &Arc<Self>, event: RemoteEvent) {
        let Some(request) = decode::<ForceResync>(&event) else {
            return;
        };
        let targeted = match &request.targets {
            None => true,
            Some(targets) => targets.contains(self.self_id()),
        };
        if targeted {
            info!("Resync requested by {}", event.origin_node_id);
            self.resync();
        } else {
            debug!(
                "Ignoring resync from {} aimed at other nodes",
                event.origin_node_id
            );
        }
    }

    fn on_leave(&self, event: RemoteEvent) {
        if self.view.remove_leaving_node(&event.origin_node_id) {
            debug!("{} from {}", event.event_type, event.origin_node_id);
        }
    }

    fn notify_discovered(&self, node_id: &NodeId, address: &NodeAddress) {
        let listeners = self.discovery_listeners.read().clone();
        for listener in listeners {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| listener.on_discovered(node_id, address)));
            if outcome.is_err() {
                error!("Discovery listener panicked on {}", node_id);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.resync_task.get_mut().take() {
            task.abort();
        }
        self.controller.stop();
        self.consumer.stop();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("self_id", self.self_id())
            .field("domain", &self.domain())
            .field("address", &self.self_address())
            .field("state", &self.state())
            .field("peers", &self.node_count())
            .finish()
    }
}

fn decode<T: bincode::Decode<()>>(event: &RemoteEvent) -> Option<T> {
    match from_bytes(&event.data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                "Malformed '{}' from {}: {}",
                event.event_type, event.origin_node_id, e
            );
            None
        }
    }
}

/// Routes reserved protocol events back into the channel
struct ProtocolListener {
    channel: Weak<Channel>,
}

#[async_trait]
impl AsyncListener for ProtocolListener {
    async fn on_event(&self, event: RemoteEvent) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_protocol_event(event).await;
        }
    }
}

#[async_trait]
impl SyncListener for ProtocolListener {
    async fn on_sync_event(&self, event: RemoteEvent) -> Option<Bytes> {
        let channel = self.channel.upgrade()?;
        channel.controller.handle_sync_control(event).await
    }
}

struct ResyncOnConnect {
    channel: Weak<Channel>,
}

impl ConnectionListener for ResyncOnConnect {
    fn on_connected(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.resync();
        }
    }

    fn on_disconnected(&self) {
        match self.channel.upgrade() {
            Some(channel) if channel.is_started() => {
                warn!("Channel {} lost its broadcast transport", channel.self_id());
            }
            _ => {}
        }
    }

    fn on_reconnected(&self) {
        if let Some(channel) = self.channel.upgrade() {
            info!("Channel {} reconnected, resyncing", channel.self_id());
            channel.resync();
        }
    }
}
