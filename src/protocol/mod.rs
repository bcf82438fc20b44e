//! Membership Protocol Messages
//!
//! Payloads of the reserved protocol event types, and the frame format
//! used by stream transports. Everything is serialized with bincode.

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::event::{DomainScope, RemoteEvent};
use crate::node::{NodeAddress, NodeId};

/// Protocol version carried in gossip for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Broadcast announcement of a node's address
pub const PUBLISH: &str = "vibemesh.publish";
/// Unicast reply to `PUBLISH`
pub const DISCOVER: &str = "vibemesh.discover";
/// Request that (some) receivers re-run discovery
pub const FORCE_RESYNC: &str = "vibemesh.resync";
/// The sender is closing
pub const SHUTDOWN: &str = "vibemesh.shutdown";
/// The sender is leaving the domain
pub const LEAVE: &str = "vibemesh.leave";
/// Failure detector traffic, see [`ControlMessage`]
pub const CONTROL: &str = "vibemesh.control";

/// All reserved protocol event types
pub const PROTOCOL_TYPES: [&str; 6] = [PUBLISH, DISCOVER, FORCE_RESYNC, SHUTDOWN, LEAVE, CONTROL];

/// Upper bound on a single stream frame, and on what any decode may allocate
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload a single IPv4 UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Body of `PUBLISH` and `DISCOVER`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Announce {
    pub address: NodeAddress,
}

/// Body of `FORCE_RESYNC`; `None` targets every receiver
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ForceResync {
    pub targets: Option<Vec<NodeId>>,
}

/// One member as seen by the gossip sender
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct GossipEntry {
    pub node_id: NodeId,
    pub address: NodeAddress,
    /// Last heartbeat version the sender observed for this member
    pub version: u64,
}

/// Synchronous probe requests
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum SyncRequest {
    /// Direct liveness probe of the receiver
    Ping,
    /// Ask the receiver to probe `target` on our behalf
    HealthCheck {
        target: NodeId,
        address: NodeAddress,
    },
}

/// Replies to [`SyncRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum SyncReply {
    Pong,
    Reachable(bool),
}

/// Body of `CONTROL`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ControlMessage {
    /// Full membership view, broadcast to the domain
    Notification {
        version: u8,
        heartbeat: u64,
        entries: Vec<GossipEntry>,
    },
    /// Partial membership view, unicast to a few random peers
    GossipNotification {
        version: u8,
        heartbeat: u64,
        entries: Vec<GossipEntry>,
    },
    /// A probe expecting a [`SyncReply`]
    SynchronousRequest(SyncRequest),
    /// Generic control event, redelivered to local listeners as `name`
    Event { name: String, data: Vec<u8> },
}

impl ControlMessage {
    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Notification { .. } => "Notification",
            ControlMessage::GossipNotification { .. } => "GossipNotification",
            ControlMessage::SynchronousRequest(SyncRequest::Ping) => "Ping",
            ControlMessage::SynchronousRequest(SyncRequest::HealthCheck { .. }) => "HealthCheck",
            ControlMessage::Event { .. } => "Event",
        }
    }
}

/// Encode any protocol payload
pub fn to_bytes<T: Encode>(value: &T) -> Result<Bytes, bincode::error::EncodeError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map(Bytes::from)
}

/// Decode any protocol payload, allocating at most `MAX_FRAME_SIZE`
pub fn from_bytes<T: Decode<()>>(data: &[u8]) -> Result<T, bincode::error::DecodeError> {
    decode_within::<MAX_FRAME_SIZE, T>(data)
}

/// Decode with an explicit allocation limit. Length prefixes claiming more
/// than `LIMIT` bytes fail with `LimitExceeded` before anything is allocated.
pub fn decode_within<const LIMIT: usize, T: Decode<()>>(
    data: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    let config = bincode::config::standard().with_limit::<LIMIT>();
    bincode::decode_from_slice(data, config).map(|(value, _)| value)
}

/// Serialized form of [`RemoteEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct WireEvent {
    pub domain: DomainScope,
    pub event_type: String,
    pub data: Vec<u8>,
    pub origin_node_id: NodeId,
    pub origin_address: NodeAddress,
}

impl From<&RemoteEvent> for WireEvent {
    fn from(event: &RemoteEvent) -> Self {
        Self {
            domain: event.domain.clone(),
            event_type: event.event_type.clone(),
            data: event.data.to_vec(),
            origin_node_id: event.origin_node_id.clone(),
            origin_address: event.origin_address.clone(),
        }
    }
}

impl From<WireEvent> for RemoteEvent {
    fn from(wire: WireEvent) -> Self {
        Self {
            domain: wire.domain,
            event_type: wire.event_type,
            data: Bytes::from(wire.data),
            origin_node_id: wire.origin_node_id,
            origin_address: wire.origin_address,
        }
    }
}

/// Frames exchanged over stream transports
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum WireFrame {
    Request {
        id: u64,
        expects_reply: bool,
        event: WireEvent,
    },
    Reply {
        id: u64,
        data: Option<Vec<u8>>,
    },
}

/// Frame a message with length prefix for stream transmission
pub fn frame_message(frame: &WireFrame) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = bincode::encode_to_vec(frame, bincode::config::standard())?;
    let len = payload.len() as u32;

    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);

    Ok(out)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u32) -> GossipEntry {
        GossipEntry {
            node_id: NodeId::new(format!("n{}", n)),
            address: NodeAddress::new(format!("10.0.0.{}:7947", n)),
            version: n as u64,
        }
    }

    #[test]
    fn test_gossip_round_trip() {
        let msg = ControlMessage::GossipNotification {
            version: PROTOCOL_VERSION,
            heartbeat: 42,
            entries: vec![entry(1), entry(2)],
        };

        let bytes = to_bytes(&msg).unwrap();
        let decoded: ControlMessage = from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<ControlMessage, _> = from_bytes(&[0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }

    /// `DomainScope::All`, then an event type whose varint length claims 4 TiB
    fn oversized_wire_event() -> Vec<u8> {
        let mut bytes = vec![1, 253];
        bytes.extend_from_slice(&(1u64 << 42).to_le_bytes());
        bytes
    }

    #[test]
    fn test_huge_length_prefix_is_rejected() {
        let bytes = oversized_wire_event();
        assert!(matches!(
            from_bytes::<WireEvent>(&bytes),
            Err(bincode::error::DecodeError::LimitExceeded)
        ));
        assert!(matches!(
            decode_within::<MAX_DATAGRAM_SIZE, WireEvent>(&bytes),
            Err(bincode::error::DecodeError::LimitExceeded)
        ));
    }

    #[test]
    fn test_limit_admits_payloads_that_fit() {
        let event = RemoteEvent::new(
            DomainScope::All,
            "x",
            Bytes::from(vec![7u8; 1024]),
            NodeId::from("a"),
            NodeAddress::from("mem:1"),
        );
        let bytes = to_bytes(&WireEvent::from(&event)).unwrap();
        let decoded = decode_within::<MAX_DATAGRAM_SIZE, WireEvent>(&bytes).unwrap();
        assert_eq!(RemoteEvent::from(decoded), event);
        assert!(decode_within::<512, WireEvent>(&bytes).is_err());
    }

    #[test]
    fn test_frame_message() {
        let frame = WireFrame::Reply {
            id: 7,
            data: Some(b"PONG".to_vec()),
        };
        let bytes = frame_message(&frame).unwrap();

        // First 4 bytes are length
        let len = read_frame_length(&bytes).unwrap();
        assert_eq!(len as usize, bytes.len() - 4);

        let decoded: WireFrame = from_bytes(&bytes[4..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_read_frame_length_needs_four_bytes() {
        assert_eq!(read_frame_length(&[0, 0, 1]), None);
    }

    #[test]
    fn test_wire_event_preserves_fields() {
        let event = RemoteEvent::new(
            DomainScope::named("test"),
            "ping",
            Bytes::from_static(b"x"),
            NodeId::from("a"),
            NodeAddress::from("mem:1"),
        );
        let back: RemoteEvent = WireEvent::from(&event).into();
        assert_eq!(back, event);
    }

    #[test]
    fn test_type_name() {
        assert_eq!(
            ControlMessage::SynchronousRequest(SyncRequest::Ping).type_name(),
            "Ping"
        );
        assert_eq!(
            ControlMessage::Event {
                name: "x".into(),
                data: vec![]
            }
            .type_name(),
            "Event"
        );
    }
}
