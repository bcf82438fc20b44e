//! In-process transport
//!
//! A `MemoryNetwork` connects any number of broadcast and unicast endpoints
//! living in one process. Endpoints can be marked unreachable to simulate
//! crashes and partitions without closing them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{
    BroadcastTransport, ConnectionListener, InboundHandler, TransportError, TransportKind,
    UnicastTransport,
};
use crate::event::RemoteEvent;
use crate::node::NodeAddress;

struct UnicastEndpoint {
    handler: Arc<dyn InboundHandler>,
    reachable: bool,
}

#[derive(Default)]
struct NetworkInner {
    next_id: AtomicU64,
    unicast: DashMap<NodeAddress, UnicastEndpoint>,
    broadcast: DashMap<u64, Arc<dyn InboundHandler>>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// New broadcast endpoint on this network
    pub fn broadcast(&self) -> MemoryBroadcast {
        MemoryBroadcast {
            network: self.clone(),
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            listeners: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// New unicast endpoint on this network
    pub fn unicast(&self) -> MemoryUnicast {
        MemoryUnicast {
            network: self.clone(),
            address: Mutex::new(None),
        }
    }

    /// Mark a unicast address (and the broadcast endpoint sharing its
    /// handler) reachable or not. Unreachable endpoints neither send nor
    /// receive.
    pub fn set_reachable(&self, addr: &NodeAddress, reachable: bool) {
        if let Some(mut endpoint) = self.inner.unicast.get_mut(addr) {
            debug!("Memory endpoint {} reachable={}", addr, reachable);
            endpoint.reachable = reachable;
        }
    }

    /// Number of registered unicast endpoints
    pub fn endpoint_count(&self) -> usize {
        self.inner.unicast.len()
    }

    fn is_reachable(&self, addr: &NodeAddress) -> bool {
        self.inner
            .unicast
            .get(addr)
            .map(|e| e.reachable)
            .unwrap_or(true)
    }

    fn unreachable_handlers(&self) -> Vec<usize> {
        self.inner
            .unicast
            .iter()
            .filter(|e| !e.reachable)
            .map(|e| handler_key(&e.handler))
            .collect()
    }

    fn target(&self, addr: &NodeAddress) -> Result<Arc<dyn InboundHandler>, TransportError> {
        match self.inner.unicast.get(addr) {
            None => Err(TransportError::ConnectionRefused(addr.to_string())),
            Some(e) if !e.reachable => Err(TransportError::Unreachable(addr.to_string())),
            Some(e) => Ok(e.handler.clone()),
        }
    }
}

fn handler_key(handler: &Arc<dyn InboundHandler>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// Broadcast endpoint of a [`MemoryNetwork`]
pub struct MemoryBroadcast {
    network: MemoryNetwork,
    id: u64,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    started: AtomicBool,
}

#[async_trait]
impl BroadcastTransport for MemoryBroadcast {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn start(&self, inbound: Arc<dyn InboundHandler>) -> Result<(), TransportError> {
        self.network.inner.broadcast.insert(self.id, inbound);
        self.started.store(true, Ordering::Release);
        for listener in self.listeners.read().iter() {
            listener.on_connected();
        }
        Ok(())
    }

    async fn dispatch(&self, event: RemoteEvent) -> Result<(), TransportError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(TransportError::NotStarted);
        }
        if !self.network.is_reachable(&event.origin_address) {
            trace!("Dropping broadcast from unreachable {}", event.origin_address);
            return Ok(());
        }

        let skip = self.network.unreachable_handlers();
        let members: Vec<Arc<dyn InboundHandler>> = self
            .network
            .inner
            .broadcast
            .iter()
            .map(|m| m.value().clone())
            .collect();

        for member in members {
            if skip.contains(&handler_key(&member)) {
                continue;
            }
            member.on_async_event(event.clone());
        }
        Ok(())
    }

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    fn address(&self) -> Option<NodeAddress> {
        self.started
            .load(Ordering::Acquire)
            .then(|| NodeAddress::new(format!("mem-group:{}", self.id)))
    }

    async fn close(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            self.network.inner.broadcast.remove(&self.id);
            for listener in self.listeners.read().iter() {
                listener.on_disconnected();
            }
        }
    }
}

/// Unicast endpoint of a [`MemoryNetwork`]
pub struct MemoryUnicast {
    network: MemoryNetwork,
    address: Mutex<Option<NodeAddress>>,
}

impl MemoryUnicast {
    fn local(&self) -> Result<NodeAddress, TransportError> {
        let local = self.address.lock().clone().ok_or(TransportError::NotStarted)?;
        if !self.network.is_reachable(&local) {
            return Err(TransportError::Unreachable(local.to_string()));
        }
        Ok(local)
    }
}

#[async_trait]
impl UnicastTransport for MemoryUnicast {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn start(&self, inbound: Arc<dyn InboundHandler>) -> Result<NodeAddress, TransportError> {
        let id = self.network.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let address = NodeAddress::new(format!("mem:{}", id));
        self.network.inner.unicast.insert(
            address.clone(),
            UnicastEndpoint {
                handler: inbound,
                reachable: true,
            },
        );
        *self.address.lock() = Some(address.clone());
        Ok(address)
    }

    async fn dispatch(&self, addr: &NodeAddress, event: RemoteEvent) -> bool {
        if self.local().is_err() {
            return false;
        }
        match self.network.target(addr) {
            Ok(handler) => {
                handler.on_async_event(event);
                true
            }
            Err(e) => {
                trace!("Memory dispatch to {} failed: {}", addr, e);
                false
            }
        }
    }

    async fn request(
        &self,
        addr: &NodeAddress,
        event: RemoteEvent,
        timeout: Duration,
    ) -> Result<Option<Bytes>, TransportError> {
        self.local()?;
        let handler = self.network.target(addr)?;
        tokio::time::timeout(timeout, handler.on_sync_event(event))
            .await
            .map_err(|_| TransportError::Timeout)
    }

    fn address(&self) -> Option<NodeAddress> {
        self.address.lock().clone()
    }

    async fn close(&self) {
        if let Some(address) = self.address.lock().take() {
            self.network.inner.unicast.remove(&address);
        }
    }
}
