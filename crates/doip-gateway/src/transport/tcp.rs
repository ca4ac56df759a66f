//! TCP server and connection transports

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

use doip_wire::{DoipMessage, HeaderNackCode, HEADER_LENGTH};

use crate::config::ServerConfig;
use crate::connection::CloseReason;
use crate::error::TransportError;
use crate::transport::{ConnectionTransport, ServerTransport};

/// How long a single `accept` / `recv_datagram` call waits before reporting
/// that nothing is pending. Keeps the server loops responsive to the stop
/// signal.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Sockets {
    listener: Arc<TcpListener>,
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
    broadcast_addr: SocketAddr,
}

/// TCP listener plus the UDP discovery socket, per the server config.
pub struct TcpServerTransport {
    tcp_port: u16,
    udp_port: u16,
    loopback: bool,
    max_payload: u32,
    sockets: Mutex<Option<Sockets>>,
    active: AtomicBool,
}

impl TcpServerTransport {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            tcp_port: config.tcp_port,
            udp_port: config.udp_port,
            loopback: config.loopback,
            max_payload: config.max_payload,
            sockets: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    fn sockets(&self) -> Option<(Arc<TcpListener>, Arc<UdpSocket>, SocketAddr)> {
        let guard = self.sockets.lock();
        guard
            .as_ref()
            .map(|s| (s.listener.clone(), s.udp.clone(), s.broadcast_addr))
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    async fn setup(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", self.tcp_port))
            .await
            .map_err(|e| TransportError::Setup(format!("TCP bind port {}: {e}", self.tcp_port)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        let udp = UdpSocket::bind(("0.0.0.0", self.udp_port))
            .await
            .map_err(|e| TransportError::Setup(format!("UDP bind port {}: {e}", self.udp_port)))?;

        let broadcast_ip = if self.loopback {
            debug!("Announcements use loopback (127.0.0.1)");
            [127, 0, 0, 1]
        } else {
            debug!("Announcements use broadcast (255.255.255.255)");
            udp.set_broadcast(true)
                .map_err(|e| TransportError::Setup(format!("enable broadcast: {e}")))?;
            [255, 255, 255, 255]
        };

        info!(tcp = %local_addr, udp_port = self.udp_port, "Server transport ready");

        *self.sockets.lock() = Some(Sockets {
            listener: Arc::new(listener),
            udp: Arc::new(udp),
            local_addr,
            // Announce destination port is chosen per send_broadcast call.
            broadcast_addr: SocketAddr::from((broadcast_ip, 0)),
        });
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn accept(&self) -> Option<Box<dyn ConnectionTransport>> {
        if !self.is_active() {
            return None;
        }
        let (listener, _, _) = self.sockets()?;
        match tokio::time::timeout(POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!(%peer, "Accepted connection");
                Some(Box::new(TcpConnectionTransport::new(
                    stream,
                    peer,
                    self.max_payload,
                )))
            }
            Ok(Err(e)) => {
                error!(%e, "Accept failed");
                None
            }
            Err(_) => None,
        }
    }

    async fn send_broadcast(
        &self,
        msg: &DoipMessage,
        dest_port: u16,
    ) -> Result<usize, TransportError> {
        let (_, udp, broadcast_addr) = self
            .sockets()
            .ok_or(TransportError::Closed)?;
        let dest = SocketAddr::new(broadcast_addr.ip(), dest_port);
        let sent = udp.send_to(&msg.to_bytes(), dest).await?;
        debug!(%dest, bytes = sent, "Sent UDP broadcast");
        Ok(sent)
    }

    async fn recv_datagram(&self) -> Option<(Vec<u8>, SocketAddr)> {
        let (_, udp, _) = self.sockets()?;
        let mut buf = vec![0u8; HEADER_LENGTH + self.max_payload as usize];
        match tokio::time::timeout(POLL_INTERVAL, udp.recv_from(&mut buf)).await {
            Ok(Ok((len, peer))) => {
                buf.truncate(len);
                Some((buf, peer))
            }
            Ok(Err(e)) => {
                warn!(%e, "UDP receive failed");
                None
            }
            Err(_) => None,
        }
    }

    async fn send_datagram(
        &self,
        msg: &DoipMessage,
        dest: SocketAddr,
    ) -> Result<usize, TransportError> {
        let (_, udp, _) = self.sockets().ok_or(TransportError::Closed)?;
        Ok(udp.send_to(&msg.to_bytes(), dest).await?)
    }

    fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Closing server transport");
            *self.sockets.lock() = None;
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn identifier(&self) -> String {
        format!("tcp-server:0.0.0.0:{}", self.tcp_port)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.sockets.lock().as_ref().map(|s| s.local_addr)
    }
}

/// One connected TCP peer. Owns its stream; the socket closes on drop.
///
/// The connection event loop may cancel an in-flight `receive` when a
/// timer or downstream event wins the race, so frame progress lives in the
/// struct and the next call resumes where the last one left off.
pub struct TcpConnectionTransport {
    stream: TcpStream,
    identifier: String,
    max_payload: u32,
    active: bool,
    frame: Vec<u8>,
    filled: usize,
    frame_total: Option<usize>,
}

impl TcpConnectionTransport {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_payload: u32) -> Self {
        Self {
            stream,
            identifier: peer.to_string(),
            max_payload,
            active: true,
            frame: vec![0u8; HEADER_LENGTH],
            filled: 0,
            frame_total: None,
        }
    }

    /// Read one complete frame and parse it. Clean end-of-stream at a
    /// frame boundary maps to `Ok(None)`.
    async fn read_frame(&mut self) -> Result<Option<DoipMessage>, TransportError> {
        while self.filled < HEADER_LENGTH {
            let n = self
                .stream
                .read(&mut self.frame[self.filled..HEADER_LENGTH])
                .await?;
            if n == 0 {
                if self.filled == 0 {
                    debug!(peer = %self.identifier, "Peer disconnected");
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                )
                .into());
            }
            self.filled += n;
        }

        let total = match self.frame_total {
            Some(total) => total,
            None => {
                let (_, length) = DoipMessage::parse_header(&self.frame[..HEADER_LENGTH])?;
                if length > self.max_payload {
                    warn!(
                        peer = %self.identifier,
                        length,
                        max = self.max_payload,
                        "Declared payload exceeds limit"
                    );
                    let nack = DoipMessage::generic_nack(HeaderNackCode::MessageTooLarge);
                    let _ = self.stream.write_all(&nack.to_bytes()).await;
                    return Err(TransportError::Protocol(
                        doip_wire::WireError::PayloadTooLarge(length, self.max_payload),
                    ));
                }
                let total = HEADER_LENGTH + length as usize;
                self.frame.resize(total, 0);
                self.frame_total = Some(total);
                total
            }
        };

        while self.filled < total {
            let n = self.stream.read(&mut self.frame[self.filled..total]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                )
                .into());
            }
            self.filled += n;
        }

        let msg = DoipMessage::parse(&self.frame[..total])?;
        self.filled = 0;
        self.frame_total = None;
        self.frame.resize(HEADER_LENGTH, 0);
        Ok(Some(msg))
    }
}

#[async_trait]
impl ConnectionTransport for TcpConnectionTransport {
    async fn send(&mut self, msg: &DoipMessage) -> Result<usize, TransportError> {
        if !self.active {
            warn!(peer = %self.identifier, "Send on closed transport");
            return Err(TransportError::Closed);
        }
        let bytes = msg.to_bytes();
        if let Err(e) = self.stream.write_all(&bytes).await {
            error!(peer = %self.identifier, %e, "Send failed");
            self.active = false;
            return Err(e.into());
        }
        debug!(peer = %self.identifier, bytes = bytes.len(), "Sent {msg}");
        Ok(bytes.len())
    }

    async fn receive(&mut self) -> Result<Option<DoipMessage>, TransportError> {
        if !self.active {
            return Ok(None);
        }
        match self.read_frame().await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => {
                self.active = false;
                Ok(None)
            }
            Err(e) => {
                self.active = false;
                Err(e)
            }
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.active {
            debug!(peer = %self.identifier, %reason, "Closing connection transport");
            self.active = false;
            let _ = self.stream.shutdown().await;
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn identifier(&self) -> String {
        self.identifier.clone()
    }
}
