//! DoIP server: accept loop, vehicle announcements and UDP identification

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use doip_wire::{DoipMessage, HeaderNackCode, PayloadType, WireError};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::GatewayError;
use crate::model::ModelFactory;
use crate::timer::TimerManager;
use crate::transport::tcp::TcpServerTransport;
use crate::transport::ServerTransport;

/// Idle sleep of the accept loop when nothing is pending.
const ACCEPT_IDLE: Duration = Duration::from_millis(10);

/// Grace period for loops to observe the stop flag before their handles
/// are abandoned.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// The gateway server. Owns the listening transport, the timer manager
/// shared by all connections, and the server-level tasks; each accepted
/// connection runs in its own task.
pub struct DoipServer {
    config: ServerConfig,
    transport: Arc<dyn ServerTransport>,
    timers: Arc<TimerManager>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl DoipServer {
    /// Build a server over an explicit transport (tests use the mock).
    /// Must be called from within a tokio runtime: the shared timer
    /// manager spawns its driver task here.
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn ServerTransport>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            transport,
            timers: TimerManager::new(),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Build a server over TCP/UDP sockets per the config.
    pub fn with_tcp(config: ServerConfig) -> Result<Self, GatewayError> {
        let transport = Arc::new(TcpServerTransport::new(&config));
        Self::new(config, transport)
    }

    /// Bind and listen. Fails without side effects; nothing is spawned
    /// until [`Self::start`].
    pub async fn setup(&self) -> Result<(), GatewayError> {
        self.transport.setup().await?;
        Ok(())
    }

    /// Spawn the accept loop, the announcement loop and the UDP
    /// identification responder.
    pub fn start(&self, factory: ModelFactory) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Server already started");
            return;
        }
        info!(transport = %self.transport.identifier(), "Starting DoIP server");
        self.running.store(true, Ordering::SeqCst);

        tasks.push(tokio::spawn(accept_loop(
            self.transport.clone(),
            factory,
            self.config.clone(),
            self.timers.clone(),
            self.stop_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(announce_loop(
            self.transport.clone(),
            self.config.clone(),
            self.stop_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(identification_loop(
            self.transport.clone(),
            self.config.clone(),
            self.stop_tx.subscribe(),
        )));
    }

    /// Signal every loop, wait for them to drain, then close the
    /// transport. Loops always exit before the sockets go away.
    pub async fn stop(&self) {
        info!("Stopping DoIP server");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Server task did not stop within grace period");
            }
        }

        self.transport.close();
        info!("Server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Accept connections and run one [`Connection`] task per client, all
/// sharing the server's timer manager. Failures of a single connection
/// never take the loop down.
async fn accept_loop(
    transport: Arc<dyn ServerTransport>,
    factory: ModelFactory,
    config: ServerConfig,
    timers: Arc<TimerManager>,
    stop: watch::Receiver<bool>,
) {
    info!("Accept loop started");
    let mut connections = JoinSet::new();

    while !*stop.borrow() {
        match transport.accept().await {
            Some(conn_transport) => {
                let model = factory();
                debug!(
                    peer = %conn_transport.identifier(),
                    model = model.name(),
                    "Starting connection handler"
                );
                let mut connection = Connection::new(
                    conn_transport,
                    model,
                    timers.clone(),
                    config.timers.clone(),
                );
                let stop_rx = stop.clone();
                connections.spawn(async move { connection.run(stop_rx).await });
            }
            None => tokio::time::sleep(ACCEPT_IDLE).await,
        }
        // Reap finished handlers so the set does not grow unbounded.
        while connections.try_join_next().is_some() {}
    }

    // Connection tasks observe the same stop flag; wait for them to drain.
    while connections.join_next().await.is_some() {}
    info!("Accept loop stopped");
}

/// Send the configured number of vehicle announcements, then exit.
async fn announce_loop(
    transport: Arc<dyn ServerTransport>,
    config: ServerConfig,
    mut stop: watch::Receiver<bool>,
) {
    let Some(announcement) = build_announcement(&config) else {
        return;
    };
    info!(count = config.announce_count, "Announcement loop started");

    for seq in 1..=config.announce_count {
        if *stop.borrow() {
            break;
        }
        match transport
            .send_broadcast(&announcement, config.announce_port)
            .await
        {
            Ok(bytes) => info!(seq, of = config.announce_count, bytes, "Sent vehicle announcement"),
            Err(e) => error!(%e, "Failed to send announcement"),
        }
        if seq < config.announce_count {
            tokio::select! {
                _ = tokio::time::sleep(config.announce_interval()) => {}
                _ = stop.changed() => {}
            }
        }
    }
    info!("Announcement loop stopped");
}

/// Answer vehicle identification requests arriving on the discovery
/// socket; malformed datagrams get a generic header nack.
async fn identification_loop(
    transport: Arc<dyn ServerTransport>,
    config: ServerConfig,
    stop: watch::Receiver<bool>,
) {
    let Some(announcement) = build_announcement(&config) else {
        return;
    };
    info!("Identification responder started");

    while !*stop.borrow() {
        let Some((bytes, peer)) = transport.recv_datagram().await else {
            continue;
        };
        match DoipMessage::parse(&bytes) {
            Ok(msg) if msg.payload_type() == PayloadType::VehicleIdentificationRequest => {
                debug!(%peer, "Vehicle identification request");
                if let Err(e) = transport.send_datagram(&announcement, peer).await {
                    warn!(%peer, %e, "Failed to answer identification request");
                }
            }
            Ok(msg) if msg.payload_type() == PayloadType::VehicleIdentificationResponse => {
                // Our own loopback announcements come back on this socket.
            }
            Ok(msg) => debug!(%peer, "Ignoring datagram {msg}"),
            Err(e) => {
                debug!(%peer, %e, "Malformed datagram");
                let nack = DoipMessage::generic_nack(header_nack_for(&e));
                if let Err(e) = transport.send_datagram(&nack, peer).await {
                    warn!(%peer, %e, "Failed to send header nack");
                }
            }
        }
    }
    info!("Identification responder stopped");
}

fn build_announcement(config: &ServerConfig) -> Option<DoipMessage> {
    match config.parsed_vin() {
        Ok(vin) => Some(DoipMessage::vehicle_identification_response(
            &vin,
            config.logical_address,
            &config.eid,
            &config.gid,
            config.announced_further_action(),
        )),
        Err(e) => {
            // validate() rules this out for servers built through the
            // constructors.
            error!(%e, "Announcement suppressed, invalid VIN");
            None
        }
    }
}

fn header_nack_for(e: &WireError) -> HeaderNackCode {
    match e {
        WireError::InvalidPayloadLength { .. } | WireError::PayloadTruncated { .. } => {
            HeaderNackCode::InvalidPayloadLength
        }
        WireError::PayloadTooLarge(..) => HeaderNackCode::MessageTooLarge,
        _ => HeaderNackCode::IncorrectPatternFormat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use doip_wire::DiagnosticNackCode;

    use crate::model::DefaultServerModel;
    use crate::transport::mock::{MockConnectionTransport, MockServerHandle, MockServerTransport};

    const ACTIVATION_REQUEST: [u8; 19] = [
        0x02, 0xFD, 0x00, 0x05, 0x00, 0x00, 0x00, 0x0B, 0x0E, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
    ];

    fn test_config() -> ServerConfig {
        ServerConfig {
            vin: "WAUZZZ8V9KA123456".into(),
            logical_address: 0x0028,
            eid: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
            gid: [0x10, 0x20, 0x30, 0x40, 0x50, 0x60],
            announce_count: 3,
            announce_interval_ms: 100,
            loopback: true,
            ..ServerConfig::default()
        }
    }

    fn factory() -> ModelFactory {
        Arc::new(|| Box::new(DefaultServerModel::new(0x0028)))
    }

    async fn started_server() -> (DoipServer, MockServerHandle) {
        let (transport, handle) = MockServerTransport::pair("test");
        let server = DoipServer::new(test_config(), Arc::new(transport)).unwrap();
        server.setup().await.unwrap();
        server.start(factory());
        (server, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn announces_exactly_count_times() {
        let (server, mut handle) = started_server().await;

        for _ in 0..3 {
            let (msg, port) = tokio::time::timeout(Duration::from_secs(2), handle.next_broadcast())
                .await
                .expect("missing announcement")
                .unwrap();
            assert_eq!(port, 13400);
            assert_eq!(msg.payload_type(), PayloadType::VehicleIdentificationResponse);
            assert_eq!(msg.vin().unwrap().to_string(), "WAUZZZ8V9KA123456");
            assert_eq!(msg.logical_address(), Some(0x0028));
            assert_eq!(msg.eid(), Some([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]));
            assert_eq!(msg.gid(), Some([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]));
            assert_eq!(msg.further_action(), Some(0x00));
        }

        // No fourth announcement.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.try_next_broadcast().is_none());

        server.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_connection_activates_through_the_server() {
        let (server, handle) = started_server().await;

        let (conn_transport, mut conn_handle) = MockConnectionTransport::pair("mock:peer");
        handle.inject_connection(Box::new(conn_transport));

        conn_handle.inject(DoipMessage::parse(&ACTIVATION_REQUEST).unwrap());
        let response = tokio::time::timeout(Duration::from_secs(2), conn_handle.next_sent())
            .await
            .expect("no activation response")
            .unwrap();
        assert_eq!(response.payload_type(), PayloadType::RoutingActivationResponse);
        assert_eq!(response.payload()[4], 0x10);

        // Messages without a downstream handler still get acked.
        conn_handle.inject(DoipMessage::diagnostic_message(0x0E80, 0x0028, &[0x3E, 0x00]));
        let ack = tokio::time::timeout(Duration::from_secs(2), conn_handle.next_sent())
            .await
            .expect("no ack")
            .unwrap();
        assert_eq!(ack.payload_type(), PayloadType::DiagnosticPositiveAck);
        assert_eq!(ack.diagnostic_nack_code(), None::<DiagnosticNackCode>);

        server.stop().await;
        assert!(!conn_handle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn identification_request_is_answered() {
        let (server, mut handle) = started_server().await;
        let peer: SocketAddr = "127.0.0.1:54321".parse().unwrap();

        handle.inject_datagram(
            DoipMessage::vehicle_identification_request().to_bytes(),
            peer,
        );

        let (reply, dest) = tokio::time::timeout(Duration::from_secs(2), handle.next_datagram())
            .await
            .expect("no identification reply")
            .unwrap();
        assert_eq!(dest, peer);
        assert_eq!(reply.payload_type(), PayloadType::VehicleIdentificationResponse);
        assert_eq!(reply.logical_address(), Some(0x0028));

        server.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_datagram_gets_header_nack() {
        let (server, mut handle) = started_server().await;
        let peer: SocketAddr = "127.0.0.1:54321".parse().unwrap();

        // Wrong inverse byte.
        handle.inject_datagram(vec![0x02, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00], peer);

        let (reply, dest) = tokio::time::timeout(Duration::from_secs(2), handle.next_datagram())
            .await
            .expect("no nack")
            .unwrap();
        assert_eq!(dest, peer);
        assert_eq!(reply.payload_type(), PayloadType::GenericNegativeAck);
        assert_eq!(reply.payload(), [HeaderNackCode::IncorrectPatternFormat as u8]);

        server.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_transport_inactive() {
        let (server, handle) = started_server().await;
        assert!(server.is_running());
        assert!(handle.is_active());

        server.stop().await;
        assert!(!server.is_running());
        assert!(!handle.is_active());
    }
}
