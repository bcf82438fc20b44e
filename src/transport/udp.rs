//! UDP multicast broadcast transport
//!
//! Each event is one datagram holding a bincode `WireEvent`. Multicast
//! loopback stays enabled so several nodes on one host see each other; the
//! consumer drops a node's own events.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{BroadcastTransport, ConnectionListener, InboundHandler, TransportError, TransportKind};
use crate::event::RemoteEvent;
use crate::node::NodeAddress;
use crate::protocol::{decode_within, to_bytes, WireEvent, MAX_DATAGRAM_SIZE};

/// Multicast group membership
pub struct UdpBroadcast {
    group: SocketAddr,
    interface: Ipv4Addr,
    ttl: u32,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    listeners: Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>>,
    shutdown: broadcast::Sender<()>,
}

impl UdpBroadcast {
    pub fn new(group: SocketAddr, interface: Ipv4Addr, ttl: u32) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            group,
            interface,
            ttl,
            socket: Mutex::new(None),
            listeners: Arc::new(RwLock::new(Vec::new())),
            shutdown,
        }
    }

    fn group_v4(&self) -> Result<SocketAddrV4, TransportError> {
        match self.group {
            SocketAddr::V4(addr) if addr.ip().is_multicast() => Ok(addr),
            other => Err(TransportError::InvalidConfig(format!(
                "broadcast group {} is not an IPv4 multicast address",
                other
            ))),
        }
    }

    /// Create the multicast socket with socket2, then hand it to tokio
    fn bind(&self, group: SocketAddrV4) -> Result<UdpSocket, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
        socket.bind(&SockAddr::from(bind_addr))?;
        socket.join_multicast_v4(group.ip(), &self.interface)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(self.ttl)?;
        if !self.interface.is_unspecified() {
            socket.set_multicast_if_v4(&self.interface)?;
        }
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        inbound: Arc<dyn InboundHandler>,
        listeners: Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut failing = false;

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => {
                        if failing {
                            failing = false;
                            info!("Multicast group reachable again");
                            for listener in listeners.read().iter() {
                                listener.on_reconnected();
                            }
                        }
                        match decode_within::<MAX_DATAGRAM_SIZE, WireEvent>(&buf[..n]) {
                            Ok(event) => inbound.on_async_event(event.into()),
                            Err(e) => debug!("Dropping malformed datagram from {}: {}", from, e),
                        }
                    }
                    Err(e) => {
                        if !failing {
                            failing = true;
                            warn!("Multicast receive failed: {}", e);
                            for listener in listeners.read().iter() {
                                listener.on_disconnected();
                            }
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("Multicast receive loop stopped");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl BroadcastTransport for UdpBroadcast {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn start(&self, inbound: Arc<dyn InboundHandler>) -> Result<(), TransportError> {
        let group = self.group_v4()?;
        let socket = Arc::new(self.bind(group)?);
        info!("Joined multicast group {} on {}", group, self.interface);

        *self.socket.lock() = Some(socket.clone());

        let listeners = self.listeners.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            Self::recv_loop(socket, inbound, listeners, shutdown_rx).await;
        });

        for listener in self.listeners.read().iter() {
            listener.on_connected();
        }
        Ok(())
    }

    async fn dispatch(&self, event: RemoteEvent) -> Result<(), TransportError> {
        let socket = self.socket.lock().clone().ok_or(TransportError::NotStarted)?;
        let payload = to_bytes(&WireEvent::from(&event))?;
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::Encode(format!(
                "event '{}' is {} bytes, above the datagram limit",
                event.event_type,
                payload.len()
            )));
        }
        socket.send_to(&payload, self.group).await?;
        Ok(())
    }

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    fn address(&self) -> Option<NodeAddress> {
        let started = self.socket.lock().is_some();
        started.then(|| NodeAddress::from(self.group))
    }

    async fn close(&self) {
        let socket = self.socket.lock().take();
        if let Some(socket) = socket {
            if let Ok(group) = self.group_v4() {
                if let Err(e) = socket.leave_multicast_v4(*group.ip(), self.interface) {
                    debug!("Failed to leave multicast group: {}", e);
                }
            }
            let _ = self.shutdown.send(());
            for listener in self.listeners.read().iter() {
                listener.on_disconnected();
            }
            info!("Left multicast group {}", self.group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_multicast_group() {
        let transport =
            UdpBroadcast::new("127.0.0.1:7946".parse().unwrap(), Ipv4Addr::UNSPECIFIED, 1);

        struct Nothing;
        #[async_trait]
        impl InboundHandler for Nothing {
            fn on_async_event(&self, _event: RemoteEvent) {}
            async fn on_sync_event(&self, _event: RemoteEvent) -> Option<bytes::Bytes> {
                None
            }
        }

        let result = transport.start(Arc::new(Nothing)).await;
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
        assert!(transport.address().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_requires_start() {
        let transport =
            UdpBroadcast::new("239.255.77.77:7946".parse().unwrap(), Ipv4Addr::UNSPECIFIED, 1);
        let event = RemoteEvent::new(
            crate::event::DomainScope::All,
            "x",
            bytes::Bytes::new(),
            crate::node::NodeId::from("a"),
            NodeAddress::from("127.0.0.1:1"),
        );
        assert_eq!(transport.dispatch(event).await, Err(TransportError::NotStarted));
    }
}
