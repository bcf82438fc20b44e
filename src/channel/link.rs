//! Glue between the failure detector and the channel's transports

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::consumer::EventConsumer;
use crate::controller::ControlLink;
use crate::event::{DomainScope, RemoteEvent};
use crate::node::{NodeAddress, NodeId};
use crate::protocol::{to_bytes, ControlMessage, CONTROL};
use crate::transport::{BroadcastTransport, TransportError, UnicastTransport};

/// Who we are, as stamped on every outbound event
pub(crate) struct Identity {
    pub(crate) node_id: NodeId,
    pub(crate) domain: RwLock<String>,
    pub(crate) address: RwLock<Option<NodeAddress>>,
}

impl Identity {
    pub(crate) fn new(node_id: NodeId, domain: String) -> Self {
        Self {
            node_id,
            domain: RwLock::new(domain),
            address: RwLock::new(None),
        }
    }

    pub(crate) fn domain(&self) -> String {
        self.domain.read().clone()
    }

    /// Own unicast address; only known once the unicast transport started
    pub(crate) fn address(&self) -> Result<NodeAddress, TransportError> {
        self.address.read().clone().ok_or(TransportError::NotStarted)
    }

    pub(crate) fn event(
        &self,
        scope: DomainScope,
        event_type: &str,
        data: Bytes,
    ) -> Result<RemoteEvent, TransportError> {
        Ok(RemoteEvent::new(
            scope,
            event_type,
            data,
            self.node_id.clone(),
            self.address()?,
        ))
    }
}

/// [`ControlLink`] over the channel's own transports
pub(crate) struct Link {
    identity: Arc<Identity>,
    unicast: Arc<dyn UnicastTransport>,
    broadcast: Arc<dyn BroadcastTransport>,
    consumer: Arc<EventConsumer>,
}

impl Link {
    pub(crate) fn new(
        identity: Arc<Identity>,
        unicast: Arc<dyn UnicastTransport>,
        broadcast: Arc<dyn BroadcastTransport>,
        consumer: Arc<EventConsumer>,
    ) -> Self {
        Self {
            identity,
            unicast,
            broadcast,
            consumer,
        }
    }

    fn control_event(
        &self,
        scope: DomainScope,
        message: &ControlMessage,
    ) -> Result<RemoteEvent, TransportError> {
        let data = to_bytes(message)?;
        self.identity.event(scope, CONTROL, data)
    }
}

#[async_trait]
impl ControlLink for Link {
    async fn request(
        &self,
        addr: &NodeAddress,
        message: &ControlMessage,
        timeout: Duration,
    ) -> Result<Option<Bytes>, TransportError> {
        let event = self.control_event(DomainScope::Unscoped, message)?;
        self.unicast.request(addr, event, timeout).await
    }

    async fn send(&self, addr: &NodeAddress, message: &ControlMessage) -> bool {
        match self.control_event(DomainScope::Unscoped, message) {
            Ok(event) => self.unicast.dispatch(addr, event).await,
            Err(e) => {
                debug!("Not sending {} to {}: {}", message.type_name(), addr, e);
                false
            }
        }
    }

    async fn broadcast(&self, message: &ControlMessage) -> Result<(), TransportError> {
        let scope = DomainScope::named(self.identity.domain());
        let event = self.control_event(scope, message)?;
        self.broadcast.dispatch(event).await
    }

    fn deliver(&self, event: RemoteEvent) {
        self.consumer.on_async_event(event);
    }
}
