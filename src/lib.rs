//! VibeMesh - peer-to-peer cluster membership
//!
//! Nodes in a named domain discover each other over a broadcast transport,
//! track liveness with heartbeats, gossip and delegated health checks, and
//! exchange application events over broadcast and unicast transports.
//!
//! ```no_run
//! use std::time::Duration;
//! use bytes::Bytes;
//! use vibemesh::{Channel, ChannelConfig, TransportFactory};
//!
//! # async fn demo() -> Result<(), vibemesh::ChannelError> {
//! let config = ChannelConfig::default().with_domain("orders");
//! let channel = Channel::new(config, &TransportFactory::new())?;
//! channel.start().await?;
//! channel.await_peers(Duration::from_secs(5), 1).await?;
//! channel.dispatch("order.created", Bytes::from_static(b"42")).await?;
//! channel.close().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod response;
pub mod transport;
pub mod view;

pub use channel::{
    Channel, ChannelError, ChannelRegistry, ChannelState, DiscoveryListener, DispatchHandle,
};
pub use config::{ChannelConfig, ConfigError};
pub use consumer::{async_listener, sync_listener, AsyncListener, ListenerId, SyncListener};
pub use event::{DomainScope, RemoteEvent};
pub use metrics::Metrics;
pub use node::{Health, NodeAddress, NodeId, NodeSnapshot};
pub use response::{RespList, Response, ResponseStatus};
pub use transport::{MemoryNetwork, TransportError, TransportFactory, TransportKind};
pub use view::{ViewError, ViewListener};
