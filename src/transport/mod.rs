//! Transport Layer
//!
//! The membership core moves bytes through two capabilities only:
//! broadcasting an event to a group, and unicasting an event to one
//! address (optionally waiting for a reply). Implementations:
//!
//! - **udp**: IPv4 multicast broadcast
//! - **tcp**: framed request/response unicast
//! - **memory**: in-process network, for tests and embedding

mod memory;
mod tcp;
mod udp;

pub use memory::{MemoryBroadcast, MemoryNetwork, MemoryUnicast};
pub use tcp::TcpUnicast;
pub use udp::UdpBroadcast;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use serde::Deserialize;

use crate::config::ChannelConfig;
use crate::event::RemoteEvent;
use crate::node::NodeAddress;
use crate::response::{RespList, Response};

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No reply within the allotted time
    Timeout,
    /// The target actively refused the connection
    ConnectionRefused(String),
    /// The target could not be reached or dropped the connection
    Unreachable(String),
    /// The outbound payload could not be serialized
    Encode(String),
    /// The reply could not be deserialized
    Decode(String),
    /// Unclassified IO failure
    Io(String),
    /// Address not understood by this transport
    InvalidAddress(String),
    /// Invalid transport configuration
    InvalidConfig(String),
    /// Transport used before `start`
    NotStarted,
    /// Transport already closed
    Closed,
}

impl TransportError {
    /// Failures that say something about the peer's liveness
    pub fn is_reachability(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::ConnectionRefused(_)
                | TransportError::Unreachable(_)
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "Operation timed out"),
            TransportError::ConnectionRefused(msg) => write!(f, "Connection refused: {}", msg),
            TransportError::Unreachable(msg) => write!(f, "Unreachable: {}", msg),
            TransportError::Encode(msg) => write!(f, "Encode error: {}", msg),
            TransportError::Decode(msg) => write!(f, "Decode error: {}", msg),
            TransportError::Io(msg) => write!(f, "IO error: {}", msg),
            TransportError::InvalidAddress(addr) => write!(f, "Invalid address: {}", addr),
            TransportError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            TransportError::NotStarted => write!(f, "Transport not started"),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => TransportError::ConnectionRefused(e.to_string()),
            ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::Unreachable(e.to_string()),
            _ => TransportError::Io(e.to_string()),
        }
    }
}

impl From<bincode::error::EncodeError> for TransportError {
    fn from(e: bincode::error::EncodeError) -> Self {
        TransportError::Encode(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for TransportError {
    fn from(e: bincode::error::DecodeError) -> Self {
        TransportError::Decode(e.to_string())
    }
}

/// Receiver of inbound events, handed to transports at `start`
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Fire-and-forget delivery
    fn on_async_event(&self, event: RemoteEvent);

    /// Delivery expecting a reply for the sender
    async fn on_sync_event(&self, event: RemoteEvent) -> Option<Bytes>;
}

/// Observer of the broadcast transport's connectivity
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_reconnected(&self) {}
}

/// Group broadcast capability
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Join the group and start delivering inbound events to `inbound`
    async fn start(&self, inbound: Arc<dyn InboundHandler>) -> Result<(), TransportError>;

    /// Send `event` to every member of the group
    async fn dispatch(&self, event: RemoteEvent) -> Result<(), TransportError>;

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>);

    /// Group address, once started
    fn address(&self) -> Option<NodeAddress>;

    async fn close(&self);
}

/// Point-to-point capability
#[async_trait]
pub trait UnicastTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start accepting events; returns the address peers should use
    async fn start(&self, inbound: Arc<dyn InboundHandler>) -> Result<NodeAddress, TransportError>;

    /// Fire-and-forget send; true if the transport accepted the event
    async fn dispatch(&self, addr: &NodeAddress, event: RemoteEvent) -> bool;

    /// Send and wait for the peer's reply
    async fn request(
        &self,
        addr: &NodeAddress,
        event: RemoteEvent,
        timeout: Duration,
    ) -> Result<Option<Bytes>, TransportError>;

    /// Send and wait, classifying failures into the response
    async fn send(&self, addr: &NodeAddress, event: RemoteEvent, timeout: Duration) -> Response {
        Response::from_result(addr.clone(), self.request(addr, event, timeout).await)
    }

    /// Send the same event to every address concurrently. Responses are in
    /// the order of `addrs`.
    async fn send_many(
        &self,
        addrs: &[NodeAddress],
        event: RemoteEvent,
        timeout: Duration,
    ) -> RespList {
        let sends = addrs
            .iter()
            .map(|addr| self.send(addr, event.clone(), timeout));
        join_all(sends).await.into_iter().collect()
    }

    /// Send a distinct event to each target concurrently. Responses are in
    /// the order of `targets`.
    async fn send_each(
        &self,
        targets: Vec<(NodeAddress, RemoteEvent)>,
        timeout: Duration,
    ) -> RespList {
        let sends = targets
            .into_iter()
            .map(|(addr, event)| async move { self.send(&addr, event, timeout).await });
        join_all(sends).await.into_iter().collect()
    }

    /// Own address, once started
    fn address(&self) -> Option<NodeAddress>;

    async fn close(&self);
}

/// Transport provider selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Memory,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Memory => "memory",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportKind::Udp),
            "tcp" => Ok(TransportKind::Tcp),
            "memory" | "mem" => Ok(TransportKind::Memory),
            other => Err(TransportError::InvalidConfig(format!(
                "unknown transport provider '{}'",
                other
            ))),
        }
    }
}

/// Builds transports from configuration
#[derive(Clone, Default)]
pub struct TransportFactory {
    memory: Option<MemoryNetwork>,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network used by the `memory` provider
    pub fn with_memory_network(mut self, network: MemoryNetwork) -> Self {
        self.memory = Some(network);
        self
    }

    fn memory_network(&self) -> Result<&MemoryNetwork, TransportError> {
        self.memory.as_ref().ok_or_else(|| {
            TransportError::InvalidConfig("memory provider requires a MemoryNetwork".to_string())
        })
    }

    pub fn broadcast(
        &self,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
        match config.broadcast_provider {
            TransportKind::Udp => Ok(Arc::new(UdpBroadcast::new(
                config.broadcast_group,
                config.broadcast_interface,
                config.multicast_ttl,
            ))),
            TransportKind::Memory => Ok(Arc::new(self.memory_network()?.broadcast())),
            TransportKind::Tcp => Err(TransportError::InvalidConfig(
                "tcp cannot be used as a broadcast provider".to_string(),
            )),
        }
    }

    pub fn unicast(
        &self,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn UnicastTransport>, TransportError> {
        match config.unicast_provider {
            TransportKind::Tcp => Ok(Arc::new(TcpUnicast::new(
                config.unicast_bind,
                config.unicast_advertise,
                config.max_client_connections,
            ))),
            TransportKind::Memory => Ok(Arc::new(self.memory_network()?.unicast())),
            TransportKind::Udp => Err(TransportError::InvalidConfig(
                "udp cannot be used as a unicast provider".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        use std::io::{Error, ErrorKind};

        let refused: TransportError = Error::from(ErrorKind::ConnectionRefused).into();
        assert!(matches!(refused, TransportError::ConnectionRefused(_)));
        assert!(refused.is_reachability());

        let reset: TransportError = Error::from(ErrorKind::ConnectionReset).into();
        assert!(reset.is_reachability());

        let other: TransportError = Error::from(ErrorKind::PermissionDenied).into();
        assert!(matches!(other, TransportError::Io(_)));
        assert!(!other.is_reachability());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("UDP".parse::<TransportKind>().unwrap(), TransportKind::Udp);
        assert_eq!("mem".parse::<TransportKind>().unwrap(), TransportKind::Memory);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_factory_rejects_mismatched_providers() {
        let factory = TransportFactory::new();
        let config = ChannelConfig {
            broadcast_provider: TransportKind::Tcp,
            unicast_provider: TransportKind::Udp,
            ..Default::default()
        };
        assert!(factory.broadcast(&config).is_err());
        assert!(factory.unicast(&config).is_err());
    }

    #[test]
    fn test_factory_memory_requires_network() {
        let config = ChannelConfig {
            broadcast_provider: TransportKind::Memory,
            unicast_provider: TransportKind::Memory,
            ..Default::default()
        };
        assert!(TransportFactory::new().unicast(&config).is_err());

        let factory = TransportFactory::new().with_memory_network(MemoryNetwork::new());
        assert_eq!(factory.unicast(&config).unwrap().kind(), TransportKind::Memory);
        assert_eq!(factory.broadcast(&config).unwrap().kind(), TransportKind::Memory);
    }
}
