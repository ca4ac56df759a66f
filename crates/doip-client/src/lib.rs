//! Minimal DoIP tester client
//!
//! Connects to a gateway, performs the routing activation handshake and
//! exchanges diagnostic messages. Also listens for vehicle announcements
//! on UDP. Primarily used by the gateway's integration tests; not a full
//! ISO 13400 tester.
//!
//! # Example
//!
//! ```no_run
//! use doip_client::DoipClient;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), doip_client::ClientError> {
//! let mut client =
//!     DoipClient::connect("127.0.0.1:13400", Duration::from_secs(1)).await?;
//! client.activate_routing(0x0E80).await?;
//! let response = client
//!     .diagnostic_request(0x0028, &[0x22, 0xF1, 0x90], Duration::from_secs(2))
//!     .await?;
//! assert_eq!(response.first(), Some(&0x62));
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tracing::{debug, info};

use doip_wire::{
    DoipMessage, LogicalAddress, PayloadType, RoutingResponseCode, HEADER_LENGTH,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] doip_wire::WireError),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Connection closed by the gateway")]
    Closed,

    #[error("Routing activation denied with code {0:?}")]
    ActivationDenied(Option<RoutingResponseCode>),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// A connected DoIP tester.
pub struct DoipClient {
    stream: TcpStream,
    source_address: Option<LogicalAddress>,
}

impl DoipClient {
    /// Open the TCP connection to a gateway.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout("TCP connect"))??;
        info!(peer = %stream.peer_addr()?, "Connected to gateway");
        Ok(Self {
            stream,
            source_address: None,
        })
    }

    /// Perform the routing activation handshake.
    pub async fn activate_routing(
        &mut self,
        source_address: LogicalAddress,
    ) -> Result<RoutingResponseCode, ClientError> {
        self.send(&DoipMessage::routing_activation_request(source_address))
            .await?;
        let response = self.receive().await?.ok_or(ClientError::Closed)?;
        if response.payload_type() != PayloadType::RoutingActivationResponse {
            return Err(ClientError::UnexpectedResponse(response.to_string()));
        }
        match response.routing_response_code() {
            Some(RoutingResponseCode::RouteActivated)
            | Some(RoutingResponseCode::ActivatedConfirmationRequired) => {
                self.source_address = Some(source_address);
                info!(
                    source = format_args!("0x{source_address:04X}"),
                    "Routing activated"
                );
                Ok(response.routing_response_code().unwrap_or(RoutingResponseCode::RouteActivated))
            }
            code => Err(ClientError::ActivationDenied(code)),
        }
    }

    /// Send one diagnostic message.
    pub async fn send_diagnostic(
        &mut self,
        target_address: LogicalAddress,
        user_data: &[u8],
    ) -> Result<(), ClientError> {
        let source = self.source_address.ok_or_else(|| {
            ClientError::UnexpectedResponse("routing not activated".to_string())
        })?;
        self.send(&DoipMessage::diagnostic_message(
            source,
            target_address,
            user_data,
        ))
        .await
    }

    /// Send a diagnostic request and wait for the routed UDS response,
    /// consuming the gateway's ack and answering alive checks on the way.
    pub async fn diagnostic_request(
        &mut self,
        target_address: LogicalAddress,
        user_data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError> {
        self.send_diagnostic(target_address, user_data).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout("diagnostic response"));
            }
            let msg = tokio::time::timeout(remaining, self.receive())
                .await
                .map_err(|_| ClientError::Timeout("diagnostic response"))??
                .ok_or(ClientError::Closed)?;
            match msg.payload_type() {
                PayloadType::DiagnosticPositiveAck => continue,
                PayloadType::DiagnosticNegativeAck => {
                    return Err(ClientError::UnexpectedResponse(format!(
                        "negative ack {:?}",
                        msg.diagnostic_nack_code()
                    )));
                }
                PayloadType::DiagnosticMessage => {
                    return Ok(msg.user_data().unwrap_or_default().to_vec());
                }
                PayloadType::AliveCheckRequest => {
                    self.respond_alive_check().await?;
                }
                other => {
                    return Err(ClientError::UnexpectedResponse(other.to_string()));
                }
            }
        }
    }

    /// Answer an alive check probe.
    pub async fn respond_alive_check(&mut self) -> Result<(), ClientError> {
        let source = self.source_address.unwrap_or(0);
        self.send(&DoipMessage::alive_check_response(source)).await
    }

    /// Send one framed message.
    pub async fn send(&mut self, msg: &DoipMessage) -> Result<(), ClientError> {
        debug!("TX {msg}");
        self.stream.write_all(&msg.to_bytes()).await?;
        Ok(())
    }

    /// Receive one framed message; `Ok(None)` when the gateway closed the
    /// connection.
    pub async fn receive(&mut self) -> Result<Option<DoipMessage>, ClientError> {
        let mut frame = vec![0u8; HEADER_LENGTH];
        match self.stream.read_exact(&mut frame).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let (_, length) = DoipMessage::parse_header(&frame)?;
        frame.resize(HEADER_LENGTH + length as usize, 0);
        self.stream.read_exact(&mut frame[HEADER_LENGTH..]).await?;
        let msg = DoipMessage::parse(&frame)?;
        debug!("RX {msg}");
        Ok(Some(msg))
    }
}

/// A received vehicle announcement.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub from: SocketAddr,
    pub vin: String,
    pub logical_address: LogicalAddress,
    pub eid: [u8; 6],
    pub gid: [u8; 6],
    pub message: DoipMessage,
}

/// Listens for vehicle announcements on a UDP port.
pub struct AnnouncementListener {
    socket: UdpSocket,
}

impl AnnouncementListener {
    /// Bind the listener. Pass port 0 for an ephemeral port and read it
    /// back with [`Self::local_addr`].
    pub async fn bind(port: u16) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// Broadcast a vehicle identification request.
    pub async fn send_identification_request(&self, dest: SocketAddr) -> Result<(), ClientError> {
        let is_broadcast = match dest.ip() {
            std::net::IpAddr::V4(v4) => v4.is_broadcast(),
            std::net::IpAddr::V6(_) => false,
        };
        if is_broadcast {
            self.socket.set_broadcast(true)?;
        }
        self.socket
            .send_to(&DoipMessage::vehicle_identification_request().to_bytes(), dest)
            .await?;
        Ok(())
    }

    /// Wait for the next announcement (or identification response).
    pub async fn next(&self, timeout: Duration) -> Result<Announcement, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout("vehicle announcement"));
            }
            let mut buf = vec![0u8; 1024];
            let (len, from) = tokio::time::timeout(remaining, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| ClientError::Timeout("vehicle announcement"))??;
            buf.truncate(len);

            let Ok(message) = DoipMessage::parse(&buf) else {
                debug!(%from, "Ignoring malformed datagram");
                continue;
            };
            if message.payload_type() != PayloadType::VehicleIdentificationResponse {
                debug!(%from, "Ignoring {message}");
                continue;
            }
            let vin = message
                .vin()
                .map(|v| v.to_string())
                .unwrap_or_default();
            return Ok(Announcement {
                from,
                vin,
                logical_address: message.logical_address().unwrap_or(0),
                eid: message.eid().unwrap_or_default(),
                gid: message.gid().unwrap_or_default(),
                message,
            });
        }
    }
}
