//! In-memory transports for tests
//!
//! Each mock is created as a pair: the transport half that gets handed to
//! the connection or server under test, and a handle the test keeps to
//! inject inbound traffic and drain what the server sent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use doip_wire::DoipMessage;

use crate::connection::CloseReason;
use crate::error::TransportError;
use crate::transport::{ConnectionTransport, ServerTransport};

/// Mock per-peer transport. `send` forwards to the test handle's sent
/// queue; `receive` blocks on messages the test injected.
pub struct MockConnectionTransport {
    identifier: String,
    active: Arc<AtomicBool>,
    inbound: UnboundedReceiver<DoipMessage>,
    sent: UnboundedSender<DoipMessage>,
}

/// Test-side handle of a [`MockConnectionTransport`].
pub struct MockConnectionHandle {
    inject: Option<UnboundedSender<DoipMessage>>,
    sent: UnboundedReceiver<DoipMessage>,
    active: Arc<AtomicBool>,
}

impl MockConnectionTransport {
    pub fn pair(identifier: &str) -> (Self, MockConnectionHandle) {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        (
            Self {
                identifier: identifier.to_string(),
                active: active.clone(),
                inbound: inject_rx,
                sent: sent_tx,
            },
            MockConnectionHandle {
                inject: Some(inject_tx),
                sent: sent_rx,
                active,
            },
        )
    }
}

#[async_trait]
impl ConnectionTransport for MockConnectionTransport {
    async fn send(&mut self, msg: &DoipMessage) -> Result<usize, TransportError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let size = msg.size();
        self.sent
            .send(msg.clone())
            .map_err(|_| TransportError::SendFailed("mock handle dropped".into()))?;
        Ok(size)
    }

    async fn receive(&mut self) -> Result<Option<DoipMessage>, TransportError> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(None);
        }
        // None when the handle dropped its inject side: peer disconnect.
        Ok(self.inbound.recv().await)
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(id = %self.identifier, %reason, "Closing mock transport");
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn identifier(&self) -> String {
        self.identifier.clone()
    }
}

impl MockConnectionHandle {
    /// Queue a message for the connection's next `receive`.
    pub fn inject(&self, msg: DoipMessage) {
        if let Some(tx) = &self.inject {
            let _ = tx.send(msg);
        }
    }

    /// Simulate a peer FIN: subsequent `receive` calls return `Ok(None)`
    /// once the queue drains.
    pub fn disconnect(&mut self) {
        self.inject = None;
    }

    /// Await the next message the connection sent.
    pub async fn next_sent(&mut self) -> Option<DoipMessage> {
        self.sent.recv().await
    }

    /// Pop a sent message without waiting.
    pub fn try_next_sent(&mut self) -> Option<DoipMessage> {
        self.sent.try_recv().ok()
    }

    /// Whether the transport half is still open.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Mock listener: connections and datagrams are whatever the test injects;
/// broadcasts are captured for inspection.
pub struct MockServerTransport {
    identifier: String,
    active: Arc<AtomicBool>,
    connections: AsyncMutex<UnboundedReceiver<Box<dyn ConnectionTransport>>>,
    broadcasts: UnboundedSender<(DoipMessage, u16)>,
    datagrams_in: AsyncMutex<UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    datagrams_out: UnboundedSender<(DoipMessage, SocketAddr)>,
}

/// Test-side handle of a [`MockServerTransport`].
pub struct MockServerHandle {
    connections: UnboundedSender<Box<dyn ConnectionTransport>>,
    broadcasts: UnboundedReceiver<(DoipMessage, u16)>,
    datagrams_in: UnboundedSender<(Vec<u8>, SocketAddr)>,
    datagrams_out: UnboundedReceiver<(DoipMessage, SocketAddr)>,
    active: Arc<AtomicBool>,
}

impl MockServerTransport {
    pub fn pair(identifier: &str) -> (Self, MockServerHandle) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (bcast_tx, bcast_rx) = mpsc::unbounded_channel();
        let (dgram_in_tx, dgram_in_rx) = mpsc::unbounded_channel();
        let (dgram_out_tx, dgram_out_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(false));
        (
            Self {
                identifier: identifier.to_string(),
                active: active.clone(),
                connections: AsyncMutex::new(conn_rx),
                broadcasts: bcast_tx,
                datagrams_in: AsyncMutex::new(dgram_in_rx),
                datagrams_out: dgram_out_tx,
            },
            MockServerHandle {
                connections: conn_tx,
                broadcasts: bcast_rx,
                datagrams_in: dgram_in_tx,
                datagrams_out: dgram_out_rx,
                active,
            },
        )
    }
}

#[async_trait]
impl ServerTransport for MockServerTransport {
    async fn setup(&self) -> Result<(), TransportError> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn accept(&self) -> Option<Box<dyn ConnectionTransport>> {
        if !self.is_active() {
            return None;
        }
        self.connections.lock().await.try_recv().ok()
    }

    async fn send_broadcast(
        &self,
        msg: &DoipMessage,
        dest_port: u16,
    ) -> Result<usize, TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        let size = msg.size();
        self.broadcasts
            .send((msg.clone(), dest_port))
            .map_err(|_| TransportError::SendFailed("mock handle dropped".into()))?;
        Ok(size)
    }

    async fn recv_datagram(&self) -> Option<(Vec<u8>, SocketAddr)> {
        if !self.is_active() {
            return None;
        }
        let mut rx = self.datagrams_in.lock().await;
        tokio::select! {
            datagram = rx.recv() => datagram,
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => None,
        }
    }

    async fn send_datagram(
        &self,
        msg: &DoipMessage,
        dest: SocketAddr,
    ) -> Result<usize, TransportError> {
        let size = msg.size();
        self.datagrams_out
            .send((msg.clone(), dest))
            .map_err(|_| TransportError::SendFailed("mock handle dropped".into()))?;
        Ok(size)
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn identifier(&self) -> String {
        format!("mock-server:{}", self.identifier)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl MockServerHandle {
    /// Queue a connection for the server's next `accept`.
    pub fn inject_connection(&self, transport: Box<dyn ConnectionTransport>) {
        let _ = self.connections.send(transport);
    }

    /// Await the next broadcast the server sent.
    pub async fn next_broadcast(&mut self) -> Option<(DoipMessage, u16)> {
        self.broadcasts.recv().await
    }

    pub fn try_next_broadcast(&mut self) -> Option<(DoipMessage, u16)> {
        self.broadcasts.try_recv().ok()
    }

    /// Queue a raw datagram on the discovery socket.
    pub fn inject_datagram(&self, bytes: Vec<u8>, from: SocketAddr) {
        let _ = self.datagrams_in.send((bytes, from));
    }

    /// Await the next unicast datagram reply.
    pub async fn next_datagram(&mut self) -> Option<(DoipMessage, SocketAddr)> {
        self.datagrams_out.recv().await
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
