//! ISO-TP over SocketCAN downstream provider (Linux only)
//!
//! The CAN interface must be configured and up at system level:
//!
//! ```bash
//! sudo ip link add dev vcan0 type vcan
//! sudo ip link set vcan0 up
//! ```

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socketcan_isotp::{ExtendedId, Id, IsoTpSocket, StandardId};
use tracing::{debug, error, info};

use crate::config::IsoTpConfig;
use crate::downstream::{DownstreamProvider, DownstreamResult, DownstreamSink};
use crate::error::GatewayError;

/// How long a single bus exchange may take before the provider reports a
/// timeout through the sink.
const BUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval while waiting for the ECU response on the non-blocking
/// socket.
const READ_POLL: Duration = Duration::from_millis(5);

fn can_id(raw: u32) -> Result<Id, GatewayError> {
    if raw > 0x7FF {
        ExtendedId::new(raw)
            .map(Id::Extended)
            .ok_or_else(|| GatewayError::Downstream(format!("invalid extended CAN ID 0x{raw:X}")))
    } else {
        StandardId::new(raw as u16)
            .map(Id::Standard)
            .ok_or_else(|| GatewayError::Downstream(format!("invalid CAN ID 0x{raw:X}")))
    }
}

/// Downstream provider that forwards UDS requests over an ISO-TP socket.
///
/// The socket lives behind a shared mutex; each dispatch runs its exchange
/// on the blocking thread pool while holding the lock, so request/response
/// pairs never interleave on the bus. Responses are posted through the
/// sink onto the owning connection's event queue.
pub struct IsoTpProvider {
    config: IsoTpConfig,
    socket: Arc<Mutex<Option<IsoTpSocket>>>,
}

impl IsoTpProvider {
    pub fn new(config: &IsoTpConfig) -> Self {
        Self {
            config: config.clone(),
            socket: Arc::new(Mutex::new(None)),
        }
    }

    /// One blocking request/response exchange. Runs on the blocking pool.
    fn exchange(
        socket: &mut IsoTpSocket,
        request: &[u8],
    ) -> Result<Vec<u8>, DownstreamResult> {
        if let Err(e) = socket.write(request) {
            error!(%e, "ISO-TP send failed");
            return Err(DownstreamResult::Error);
        }

        let deadline = Instant::now() + BUS_TIMEOUT;
        loop {
            match socket.read() {
                Ok(data) if !data.is_empty() => return Ok(data.to_vec()),
                Ok(_) => {}
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!(%e, "ISO-TP receive failed");
                    return Err(DownstreamResult::Error);
                }
            }
            if Instant::now() >= deadline {
                return Err(DownstreamResult::Timeout);
            }
            std::thread::sleep(READ_POLL);
        }
    }
}

impl DownstreamProvider for IsoTpProvider {
    fn name(&self) -> &str {
        "can-isotp"
    }

    fn start(&self) -> Result<(), GatewayError> {
        let mut guard = self.socket.lock();
        if guard.is_some() {
            return Ok(());
        }
        info!(
            interface = %self.config.interface,
            tx_id = format_args!("0x{:X}", self.config.tx_id),
            rx_id = format_args!("0x{:X}", self.config.rx_id),
            "Starting ISO-TP provider"
        );
        let socket = IsoTpSocket::open(
            &self.config.interface,
            can_id(self.config.rx_id)?,
            can_id(self.config.tx_id)?,
        )
        .map_err(|e| GatewayError::Downstream(format!("open ISO-TP socket: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| GatewayError::Downstream(format!("set nonblocking: {e}")))?;
        *guard = Some(socket);
        Ok(())
    }

    fn stop(&self) {
        if self.socket.lock().take().is_some() {
            info!("ISO-TP provider stopped");
        }
    }

    fn dispatch(&self, request: &[u8], sink: DownstreamSink) -> DownstreamResult {
        if self.socket.lock().is_none() {
            return DownstreamResult::Error;
        }

        let socket = self.socket.clone();
        let request = request.to_vec();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut guard = socket.lock();
            let Some(socket) = guard.as_mut() else {
                // Provider stopped while the dispatch was queued.
                sink.respond(Vec::new(), DownstreamResult::Error);
                return;
            };
            match Self::exchange(socket, &request) {
                Ok(response) => {
                    debug!(
                        bytes = response.len(),
                        latency_ms = started.elapsed().as_millis() as u64,
                        "ISO-TP response"
                    );
                    sink.respond(response, DownstreamResult::Handled);
                }
                Err(result) => sink.respond(Vec::new(), result),
            }
        });
        DownstreamResult::Pending
    }
}
