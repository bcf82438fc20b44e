//! TCP unicast transport
//!
//! Every outbound send opens a short-lived connection, writes one
//! length-prefixed `WireFrame::Request` and, for requests, waits for the
//! matching `WireFrame::Reply`. Inbound connections may carry any number of
//! frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, trace};

use super::{InboundHandler, TransportError, TransportKind, UnicastTransport};
use crate::event::RemoteEvent;
use crate::node::NodeAddress;
use crate::protocol::{
    decode_within, frame_message, read_frame_length, WireEvent, WireFrame, MAX_FRAME_SIZE,
};

/// Default budget for fire-and-forget sends
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Framed request/response over TCP
pub struct TcpUnicast {
    bind: SocketAddr,
    advertise: Option<SocketAddr>,
    max_connections: usize,
    local: Mutex<Option<NodeAddress>>,
    next_id: AtomicU64,
    permits: DashMap<SocketAddr, Arc<Semaphore>>,
    shutdown: broadcast::Sender<()>,
}

impl TcpUnicast {
    pub fn new(bind: SocketAddr, advertise: Option<SocketAddr>, max_connections: usize) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            bind,
            advertise,
            max_connections: max_connections.max(1),
            local: Mutex::new(None),
            next_id: AtomicU64::new(1),
            permits: DashMap::new(),
            shutdown,
        }
    }

    /// Address peers should connect to
    fn advertised(bound: SocketAddr, advertise: Option<SocketAddr>) -> SocketAddr {
        if let Some(addr) = advertise {
            return addr;
        }
        if bound.ip().is_unspecified() {
            let ip = local_ip().unwrap_or_else(|| std::net::Ipv4Addr::LOCALHOST.into());
            return SocketAddr::new(ip, bound.port());
        }
        bound
    }

    fn permits_for(&self, addr: SocketAddr) -> Arc<Semaphore> {
        self.permits
            .entry(addr)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_connections)))
            .clone()
    }

    /// Open a connection, write one request frame and optionally read the
    /// reply.
    async fn exchange(
        &self,
        addr: &NodeAddress,
        event: &RemoteEvent,
        expects_reply: bool,
    ) -> Result<Option<Bytes>, TransportError> {
        let started = self.local.lock().is_some();
        if !started {
            return Err(TransportError::NotStarted);
        }
        let target = addr
            .to_socket_addr()
            .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;

        let permits = self.permits_for(target);
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = frame_message(&WireFrame::Request {
            id,
            expects_reply,
            event: WireEvent::from(event),
        })?;

        let mut stream = TcpStream::connect(target).await?;
        let _ = stream.set_nodelay(true);
        stream.write_all(&frame).await?;

        if !expects_reply {
            let _ = stream.shutdown().await;
            return Ok(None);
        }

        match read_frame(&mut stream).await? {
            Some(WireFrame::Reply { id: reply_id, data }) if reply_id == id => {
                Ok(data.map(Bytes::from))
            }
            Some(other) => Err(TransportError::Decode(format!(
                "unexpected frame in reply to {}: {:?}",
                id,
                frame_kind(&other)
            ))),
            None => Err(TransportError::Unreachable(format!(
                "{} closed before replying",
                addr
            ))),
        }
    }

    /// Accept incoming peer connections until shutdown
    async fn accept_loop(
        listener: TcpListener,
        inbound: Arc<dyn InboundHandler>,
        shutdown: broadcast::Sender<()>,
    ) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        trace!("Incoming connection from {}", addr);
                        let inbound = inbound.clone();
                        let mut conn_shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            tokio::select! {
                                result = Self::handle_connection(stream, inbound) => {
                                    if let Err(e) = result {
                                        debug!("Connection from {} ended: {}", addr, e);
                                    }
                                }
                                _ = conn_shutdown.recv() => {}
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("TCP accept loop stopped");
                    return;
                }
            }
        }
    }

    /// Serve request frames from one connection
    async fn handle_connection(
        stream: TcpStream,
        inbound: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError> {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        while let Some(frame) = read_frame(&mut read_half).await? {
            match frame {
                WireFrame::Request {
                    id,
                    expects_reply,
                    event,
                } => {
                    let event = RemoteEvent::from(event);
                    if expects_reply {
                        let data = inbound.on_sync_event(event).await;
                        let reply = frame_message(&WireFrame::Reply {
                            id,
                            data: data.map(|d| d.to_vec()),
                        })?;
                        write_half.write_all(&reply).await?;
                    } else {
                        inbound.on_async_event(event);
                    }
                }
                WireFrame::Reply { id, .. } => {
                    debug!("Ignoring unsolicited reply {}", id);
                }
            }
        }
        Ok(())
    }
}

fn frame_kind(frame: &WireFrame) -> &'static str {
    match frame {
        WireFrame::Request { .. } => "request",
        WireFrame::Reply { .. } => "reply",
    }
}

/// Read one length-prefixed frame; `None` on clean EOF
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<WireFrame>, TransportError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = read_frame_length(&header).unwrap_or(0) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Decode(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(decode_within::<MAX_FRAME_SIZE, WireFrame>(&payload)?))
}

/// Best-effort discovery of the outbound interface address
fn local_ip() -> Option<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

#[async_trait]
impl UnicastTransport for TcpUnicast {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn start(&self, inbound: Arc<dyn InboundHandler>) -> Result<NodeAddress, TransportError> {
        let listener = TcpListener::bind(self.bind).await?;
        let bound = listener.local_addr()?;
        let address = NodeAddress::from(Self::advertised(bound, self.advertise));
        info!("TCP unicast listening on {} (advertised as {})", bound, address);

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            Self::accept_loop(listener, inbound, shutdown).await;
        });

        *self.local.lock() = Some(address.clone());
        Ok(address)
    }

    async fn dispatch(&self, addr: &NodeAddress, event: RemoteEvent) -> bool {
        match tokio::time::timeout(DISPATCH_TIMEOUT, self.exchange(addr, &event, false)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Dispatch of '{}' to {} failed: {}", event.event_type, addr, e);
                false
            }
            Err(_) => {
                debug!("Dispatch of '{}' to {} timed out", event.event_type, addr);
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
        tokio::time::timeout(timeout, self.exchange(addr, &event, true))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    fn address(&self) -> Option<NodeAddress> {
        self.local.lock().clone()
    }

    async fn close(&self) {
        let was_started = self.local.lock().take().is_some();
        if was_started {
            let _ = self.shutdown.send(());
            for entry in self.permits.iter() {
                entry.value().close();
            }
            info!("TCP unicast closed");
        }
    }
}
