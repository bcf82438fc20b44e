//! Remote Events
//!
//! The unit moved by the transports and fanned out by the consumer.

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::node::{NodeAddress, NodeId};

/// Which domains an event is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub enum DomainScope {
    /// Addressed to a single node, not to a domain (unicast)
    Unscoped,
    /// Broadcast to every domain
    All,
    /// Broadcast to one domain
    Named(String),
}

impl DomainScope {
    pub fn named(domain: impl Into<String>) -> Self {
        DomainScope::Named(domain.into())
    }

    /// Whether a consumer in `domain` should see this event
    pub fn admits(&self, domain: &str) -> bool {
        match self {
            DomainScope::Unscoped | DomainScope::All => true,
            DomainScope::Named(d) => d == domain,
        }
    }
}

/// An event received from (or sent to) a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub domain: DomainScope,
    pub event_type: String,
    pub data: Bytes,
    pub origin_node_id: NodeId,
    pub origin_address: NodeAddress,
}

impl RemoteEvent {
    pub fn new(
        domain: DomainScope,
        event_type: impl Into<String>,
        data: Bytes,
        origin_node_id: NodeId,
        origin_address: NodeAddress,
    ) -> Self {
        Self {
            domain,
            event_type: event_type.into(),
            data,
            origin_node_id,
            origin_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DomainScope::Unscoped, "a", true; "unscoped admitted everywhere")]
    #[test_case(DomainScope::All, "a", true; "all domains admitted everywhere")]
    #[test_case(DomainScope::named("a"), "a", true; "same domain")]
    #[test_case(DomainScope::named("a"), "b", false; "other domain")]
    #[test_case(DomainScope::named("a"), "ab", false; "no prefix matching")]
    fn test_admits(scope: DomainScope, domain: &str, expected: bool) {
        assert_eq!(scope.admits(domain), expected);
    }
}
