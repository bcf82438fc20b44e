//! Event Consumer
//!
//! Registry of listeners keyed by event type, plus the bounded worker pool
//! that fans inbound async events out to them.
//!
//! - Any number of async listeners per type; each matching event is
//!   submitted once per listener to the pool, in no particular order.
//! - At most one sync listener per type, invoked inline on the caller's
//!   task. Its return value is the reply sent back to the peer.
//!
//! An event is delivered when it did not originate from this node and its
//! scope admits the consumer's current domain.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::event::RemoteEvent;
use crate::metrics::Metrics;
use crate::node::NodeId;
use crate::pool::WorkerPool;
use crate::transport::InboundHandler;


/// Errors returned by consumer operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// A sync listener already exists for this event type
    ListenerAlreadyRegistered(String),
    /// The consumer has been stopped
    Stopped,
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::ListenerAlreadyRegistered(t) => {
                write!(f, "a sync listener is already registered for '{}'", t)
            }
            ConsumerError::Stopped => write!(f, "consumer is stopped"),
        }
    }
}

impl std::error::Error for ConsumerError {}

/// Listener for fire-and-forget events
#[async_trait]
pub trait AsyncListener: Send + Sync {
    async fn on_event(&self, event: RemoteEvent);
}

/// Listener for request/response events
#[async_trait]
pub trait SyncListener: Send + Sync {
    /// Reply to the sender; `None` means no payload
    async fn on_sync_event(&self, event: RemoteEvent) -> Option<Bytes>;
}

struct FnAsyncListener<F>(F);

#[async_trait]
impl<F, Fut> AsyncListener for FnAsyncListener<F>
where
    F: Fn(RemoteEvent) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn on_event(&self, event: RemoteEvent) {
        (self.0)(event).await
    }
}

struct FnSyncListener<F>(F);

#[async_trait]
impl<F, Fut> SyncListener for FnSyncListener<F>
where
    F: Fn(RemoteEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Bytes>> + Send,
{
    async fn on_sync_event(&self, event: RemoteEvent) -> Option<Bytes> {
        (self.0)(event).await
    }
}

/// Wrap a closure as an [`AsyncListener`]
pub fn async_listener<F, Fut>(f: F) -> Arc<dyn AsyncListener>
where
    F: Fn(RemoteEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnAsyncListener(f))
}

/// Wrap a closure as a [`SyncListener`]
pub fn sync_listener<F, Fut>(f: F) -> Arc<dyn SyncListener>
where
    F: Fn(RemoteEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Bytes>> + Send + 'static,
{
    Arc::new(FnSyncListener(f))
}

/// Handle returned by every registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Registration {
    Async(String),
    Sync(String),
}

type AsyncEntries = SmallVec<[(ListenerId, Arc<dyn AsyncListener>); 4]>;

#[derive(Default)]
struct Registry {
    async_listeners: AHashMap<String, AsyncEntries>,
    sync_listeners: AHashMap<String, (ListenerId, Arc<dyn SyncListener>)>,
    index: AHashMap<ListenerId, Registration>,
}

/// Inbound event fan-out for one channel
pub struct EventConsumer {
    self_id: NodeId,
    domain: RwLock<String>,
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    stopped: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl EventConsumer {
    pub fn new(self_id: NodeId, domain: impl Into<String>) -> Self {
        Self {
            self_id,
            domain: RwLock::new(domain.into()),
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            pool: Mutex::new(None),
            stopped: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the delivery pool. Must run inside a tokio runtime; calling it
    /// again is a no-op.
    pub fn start(&self, workers: usize, capacity: usize) -> Result<(), ConsumerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ConsumerError::Stopped);
        }
        let mut pool = self.pool.lock();
        if pool.is_none() {
            *pool = Some(Arc::new(WorkerPool::new("consumer", workers, capacity)));
        }
        Ok(())
    }

    /// Stop delivering. Queued deliveries are dropped.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn domain(&self) -> String {
        self.domain.read().clone()
    }

    /// Switch the domain used for matching. Deliveries already in progress
    /// keep the domain they captured.
    pub fn change_domain(&self, domain: impl Into<String>) {
        let domain = domain.into();
        debug!("Consumer {} switching to domain '{}'", self.self_id, domain);
        *self.domain.write() = domain;
    }

    fn ensure_running(&self) -> Result<(), ConsumerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ConsumerError::Stopped);
        }
        Ok(())
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add an async listener for `event_type`. Fails once stopped.
    pub fn register_async(
        &self,
        event_type: impl Into<String>,
        listener: Arc<dyn AsyncListener>,
    ) -> Result<ListenerId, ConsumerError> {
        self.ensure_running()?;
        let event_type = event_type.into();
        let id = self.allocate_id();
        let mut registry = self.registry.write();
        registry
            .async_listeners
            .entry(event_type.clone())
            .or_default()
            .push((id, listener));
        registry.index.insert(id, Registration::Async(event_type));
        Ok(id)
    }

    /// Register the single sync listener for `event_type`
    pub fn register_sync(
        &self,
        event_type: impl Into<String>,
        listener: Arc<dyn SyncListener>,
    ) -> Result<ListenerId, ConsumerError> {
        self.ensure_running()?;
        let event_type = event_type.into();
        let mut registry = self.registry.write();
        if registry.sync_listeners.contains_key(&event_type) {
            return Err(ConsumerError::ListenerAlreadyRegistered(event_type));
        }
        let id = self.allocate_id();
        registry
            .sync_listeners
            .insert(event_type.clone(), (id, listener));
        registry.index.insert(id, Registration::Sync(event_type));
        Ok(id)
    }

    /// Remove a registration; returns false if it was not registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.write();
        match registry.index.remove(&id) {
            Some(Registration::Async(event_type)) => {
                if let Some(entries) = registry.async_listeners.get_mut(&event_type) {
                    entries.retain(|(entry_id, _)| *entry_id != id);
                    if entries.is_empty() {
                        registry.async_listeners.remove(&event_type);
                    }
                }
                true
            }
            Some(Registration::Sync(event_type)) => {
                registry.sync_listeners.remove(&event_type);
                true
            }
            None => false,
        }
    }

    /// Number of listeners (async and sync) for `event_type`
    pub fn listener_count(&self, event_type: &str) -> usize {
        let registry = self.registry.read();
        let async_count = registry
            .async_listeners
            .get(event_type)
            .map(|l| l.len())
            .unwrap_or(0);
        let sync_count = usize::from(registry.sync_listeners.contains_key(event_type));
        async_count + sync_count
    }

    /// Whether this consumer should see `event`
    pub fn matches(&self, event: &RemoteEvent) -> bool {
        if event.origin_node_id == self.self_id {
            return false;
        }
        let domain = self.domain.read();
        event.domain.admits(&domain)
    }

    /// Fan an async event out to every matching listener
    pub fn on_async_event(&self, event: RemoteEvent) {
        if !self.matches(&event) {
            trace!(
                "Ignoring '{}' from {} ({:?})",
                event.event_type,
                event.origin_node_id,
                event.domain
            );
            return;
        }

        let listeners: SmallVec<[Arc<dyn AsyncListener>; 4]> = match self
            .registry
            .read()
            .async_listeners
            .get(&event.event_type)
        {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };

        let Some(pool) = self.pool.lock().clone() else {
            debug!("Consumer not running, dropping '{}'", event.event_type);
            return;
        };

        for listener in listeners {
            let job_event = event.clone();
            let job = async move {
                let event_type = job_event.event_type.clone();
                let outcome = AssertUnwindSafe(listener.on_event(job_event))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    error!("Async listener for '{}' panicked", event_type);
                }
            };

            match pool.submit(job) {
                Ok(()) => {
                    if let Some(m) = &self.metrics {
                        m.events_delivered.inc();
                    }
                }
                Err(e) => {
                    warn!("Dropping delivery of '{}': {}", event.event_type, e);
                    if let Some(m) = &self.metrics {
                        m.events_dropped.inc();
                    }
                }
            }
        }
    }

    /// Invoke the sync listener for `event` and return its reply
    pub async fn on_sync_event(&self, event: RemoteEvent) -> Option<Bytes> {
        if !self.matches(&event) {
            trace!("Ignoring sync '{}' from {}", event.event_type, event.origin_node_id);
            return None;
        }

        let listener = self
            .registry
            .read()
            .sync_listeners
            .get(&event.event_type)
            .map(|(_, l)| l.clone());
        let Some(listener) = listener else {
            debug!("No sync listener for '{}'", event.event_type);
            return None;
        };

        let event_type = event.event_type.clone();
        match AssertUnwindSafe(listener.on_sync_event(event))
            .catch_unwind()
            .await
        {
            Ok(reply) => reply,
            Err(_) => {
                error!("Sync listener for '{}' panicked", event_type);
                None
            }
        }
    }
}

#[async_trait]
impl InboundHandler for EventConsumer {
    fn on_async_event(&self, event: RemoteEvent) {
        EventConsumer::on_async_event(self, event)
    }

    async fn on_sync_event(&self, event: RemoteEvent) -> Option<Bytes> {
        EventConsumer::on_sync_event(self, event).await
    }
}
