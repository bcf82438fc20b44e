//! Responses to synchronous sends
//!
//! A `Response` is produced for every target of a synchronous send, even
//! when the target could not be reached. Reachability failures become
//! `ResponseStatus::Suspect`; a peer that answered with something unusable
//! yields a response carrying the error.

use bytes::Bytes;

use crate::node::NodeAddress;
use crate::transport::TransportError;

/// Outcome class of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The peer answered
    Ok,
    /// The peer could not be reached in time
    Suspect,
}

/// The answer of one peer to a synchronous send
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    source: NodeAddress,
    data: Option<Bytes>,
    status: ResponseStatus,
    error: Option<TransportError>,
}

impl Response {
    pub fn ok(source: NodeAddress, data: Option<Bytes>) -> Self {
        Self {
            source,
            data,
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    pub fn suspect(source: NodeAddress, error: TransportError) -> Self {
        Self {
            source,
            data: None,
            status: ResponseStatus::Suspect,
            error: Some(error),
        }
    }

    pub fn failed(source: NodeAddress, error: TransportError) -> Self {
        Self {
            source,
            data: None,
            status: ResponseStatus::Ok,
            error: Some(error),
        }
    }

    /// Classify the raw outcome of a request
    pub fn from_result(source: NodeAddress, result: Result<Option<Bytes>, TransportError>) -> Self {
        match result {
            Ok(data) => Self::ok(source, data),
            Err(e) if e.is_reachability() => Self::suspect(source, e),
            Err(e) => Self::failed(source, e),
        }
    }

    pub fn source(&self) -> &NodeAddress {
        &self.source
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Bytes> {
        self.data
    }

    /// The peer answered without a payload (or not at all)
    pub fn is_none(&self) -> bool {
        self.data.is_none()
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn is_suspect(&self) -> bool {
        self.status == ResponseStatus::Suspect
    }

    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    /// Answered, with no error attached
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok && self.error.is_none()
    }
}

/// Responses of a multi-target send, in send order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RespList {
    responses: Vec<Response>,
}

impl RespList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, response: Response) {
        self.responses.push(response);
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Response> {
        self.responses.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Response> {
        self.responses.iter()
    }

    /// The response from `source`, if it was a target
    pub fn from_source(&self, source: &NodeAddress) -> Option<&Response> {
        self.responses.iter().find(|r| r.source() == source)
    }

    pub fn successes(&self) -> impl Iterator<Item = &Response> {
        self.responses.iter().filter(|r| r.is_ok())
    }

    pub fn suspects(&self) -> impl Iterator<Item = &Response> {
        self.responses.iter().filter(|r| r.is_suspect())
    }
}

impl FromIterator<Response> for RespList {
    fn from_iter<I: IntoIterator<Item = Response>>(iter: I) -> Self {
        Self {
            responses: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for RespList {
    type Item = Response;
    type IntoIter = std::vec::IntoIter<Response>;

    fn into_iter(self) -> Self::IntoIter {
        self.responses.into_iter()
    }
}

impl<'a> IntoIterator for &'a RespList {
    type Item = &'a Response;
    type IntoIter = std::slice::Iter<'a, Response>;

    fn into_iter(self) -> Self::IntoIter {
        self.responses.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn addr() -> NodeAddress {
        NodeAddress::from("mem:1")
    }

    #[test_case(TransportError::Timeout, ResponseStatus::Suspect; "timeout")]
    #[test_case(TransportError::ConnectionRefused("x".into()), ResponseStatus::Suspect; "refused")]
    #[test_case(TransportError::Unreachable("x".into()), ResponseStatus::Suspect; "unreachable")]
    #[test_case(TransportError::Decode("x".into()), ResponseStatus::Ok; "decode")]
    #[test_case(TransportError::Io("x".into()), ResponseStatus::Ok; "io")]
    fn test_failure_classification(error: TransportError, status: ResponseStatus) {
        let response = Response::from_result(addr(), Err(error.clone()));
        assert_eq!(response.status(), status);
        assert_eq!(response.error(), Some(&error));
        assert!(response.is_none());
        assert!(!response.is_ok());
    }

    #[test]
    fn test_success_carries_data() {
        let response = Response::from_result(addr(), Ok(Some(Bytes::from_static(b"PONG"))));
        assert!(response.is_ok());
        assert_eq!(response.data().unwrap().as_ref(), b"PONG");
    }

    #[test]
    fn test_resp_list_filters() {
        let list: RespList = vec![
            Response::ok(NodeAddress::from("mem:1"), None),
            Response::suspect(NodeAddress::from("mem:2"), TransportError::Timeout),
            Response::failed(NodeAddress::from("mem:3"), TransportError::Closed),
        ]
        .into_iter()
        .collect();

        assert_eq!(list.len(), 3);
        assert_eq!(list.successes().count(), 1);
        assert_eq!(list.suspects().count(), 1);
        assert!(list.from_source(&NodeAddress::from("mem:3")).is_some());
        assert!(list.from_source(&NodeAddress::from("mem:4")).is_none());
    }
}
