//! State machine tests against the mock transport

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{advance, timeout};

use doip_wire::{DiagnosticNackCode, DoipMessage, PayloadType};

use super::*;
use crate::config::{MockUdsConfig, TimerConfig};
use crate::downstream::mock::{MockUdsMode, MockUdsProvider};
use crate::downstream::DownstreamProvider;
use crate::transport::mock::{MockConnectionHandle, MockConnectionTransport};

const CLIENT: u16 = 0x0E80;
const SERVER: u16 = 0x0028;

// Wire bytes of the activation handshake with the addresses above.
const ACTIVATION_REQUEST: [u8; 19] = [
    0x02, 0xFD, 0x00, 0x05, 0x00, 0x00, 0x00, 0x0B, 0x0E, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];
const ACTIVATION_RESPONSE: [u8; 17] = [
    0x02, 0xFD, 0x00, 0x06, 0x00, 0x00, 0x00, 0x09, 0x0E, 0x80, 0x00, 0x28, 0x10, 0x00, 0x00,
    0x00, 0x00,
];

#[derive(Default)]
struct ModelLog {
    opened: AtomicU32,
    diagnostics: AtomicU32,
    acks: Mutex<Vec<Option<DiagnosticNackCode>>>,
    closes: Mutex<Vec<CloseReason>>,
}

struct TestModel {
    log: Arc<ModelLog>,
    veto: Option<DiagnosticNackCode>,
    provider: Option<Arc<dyn DownstreamProvider>>,
}

impl TestModel {
    fn new(log: Arc<ModelLog>) -> Self {
        Self {
            log,
            veto: None,
            provider: None,
        }
    }

    fn with_provider(log: Arc<ModelLog>, provider: Arc<dyn DownstreamProvider>) -> Self {
        Self {
            log,
            veto: None,
            provider: Some(provider),
        }
    }

    fn with_veto(log: Arc<ModelLog>, veto: DiagnosticNackCode) -> Self {
        Self {
            log,
            veto: Some(veto),
            provider: None,
        }
    }
}

impl ServerModel for TestModel {
    fn name(&self) -> &str {
        "test"
    }

    fn server_address(&self) -> u16 {
        SERVER
    }

    fn on_open_connection(&mut self, _info: &ConnectionInfo) {
        self.log.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_diagnostic_message(
        &mut self,
        _info: &ConnectionInfo,
        _msg: &DoipMessage,
    ) -> Option<DiagnosticNackCode> {
        self.log.diagnostics.fetch_add(1, Ordering::SeqCst);
        self.veto
    }

    fn on_diagnostic_notification(
        &mut self,
        _info: &ConnectionInfo,
        ack: Option<DiagnosticNackCode>,
    ) {
        self.log.acks.lock().push(ack);
    }

    fn has_downstream(&self) -> bool {
        self.provider.is_some()
    }

    fn on_downstream_request(
        &mut self,
        _info: &ConnectionInfo,
        msg: &DoipMessage,
        sink: DownstreamSink,
    ) -> DownstreamResult {
        match (&self.provider, msg.user_data()) {
            (Some(provider), Some(request)) => provider.dispatch(request, sink),
            _ => DownstreamResult::Error,
        }
    }

    fn on_close_connection(&mut self, _info: &ConnectionInfo, reason: CloseReason) {
        self.log.closes.lock().push(reason);
    }
}

/// Provider that only counts dispatches.
#[derive(Default)]
struct CountingProvider {
    dispatches: AtomicU32,
}

impl DownstreamProvider for CountingProvider {
    fn name(&self) -> &str {
        "counting"
    }

    fn dispatch(&self, _request: &[u8], _sink: DownstreamSink) -> DownstreamResult {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        DownstreamResult::Handled
    }
}

fn fast_timers() -> TimerConfig {
    TimerConfig {
        general_inactivity_ms: 500,
        ..TimerConfig::default()
    }
}

fn new_connection(model: TestModel, timers: TimerConfig) -> (Connection, MockConnectionHandle) {
    let (transport, handle) = MockConnectionTransport::pair("mock:client");
    let connection = Connection::new(
        Box::new(transport),
        Box::new(model),
        TimerManager::new(),
        timers,
    );
    (connection, handle)
}

async fn activate(connection: &mut Connection, handle: &mut MockConnectionHandle) {
    connection
        .handle_message(DoipMessage::parse(&ACTIVATION_REQUEST).unwrap())
        .await;
    let response = handle.next_sent().await.unwrap();
    assert_eq!(response.to_bytes(), ACTIVATION_RESPONSE);
}

async fn next_sent(handle: &mut MockConnectionHandle) -> DoipMessage {
    timeout(Duration::from_secs(5), handle.next_sent())
        .await
        .expect("no message sent")
        .expect("transport gone")
}

/// Poll until `predicate` holds; paused time auto-advances through the
/// sleeps.
async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn activation_happy_path_handshake_bytes() {
    let log = Arc::new(ModelLog::default());
    let (mut connection, mut handle) = new_connection(TestModel::new(log.clone()), fast_timers());

    assert_eq!(connection.state(), ConnectionState::WaitRoutingActivation);
    assert_eq!(log.opened.load(Ordering::SeqCst), 1);

    activate(&mut connection, &mut handle).await;

    assert_eq!(connection.state(), ConnectionState::RoutingActivated);
    assert_eq!(connection.client_address(), Some(CLIENT));
}

#[tokio::test(start_paused = true)]
async fn non_activation_first_message_closes() {
    let log = Arc::new(ModelLog::default());
    let (mut connection, handle) = new_connection(TestModel::new(log.clone()), fast_timers());

    connection
        .handle_message(DoipMessage::alive_check_request())
        .await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!handle.is_active());
    assert_eq!(*log.closes.lock(), vec![CloseReason::InvalidMessage]);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_source_is_denied_and_closed() {
    let log = Arc::new(ModelLog::default());
    let (mut connection, mut handle) = new_connection(TestModel::new(log.clone()), fast_timers());

    // 0xD010 is not a tester address.
    let mut request = ACTIVATION_REQUEST;
    request[8] = 0xD0;
    request[9] = 0x10;
    connection
        .handle_message(DoipMessage::parse(&request).unwrap())
        .await;

    let denial = next_sent(&mut handle).await;
    assert_eq!(denial.payload_type(), PayloadType::RoutingActivationResponse);
    assert_eq!(denial.payload()[4], 0x00);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(*log.closes.lock(), vec![CloseReason::InvalidMessage]);
}

#[tokio::test(start_paused = true)]
async fn unknown_payload_after_activation_is_nacked_and_survives() {
    let log = Arc::new(ModelLog::default());
    let (mut connection, mut handle) = new_connection(TestModel::new(log.clone()), fast_timers());
    activate(&mut connection, &mut handle).await;

    let unknown = DoipMessage::parse(&[0x02, 0xFD, 0x00, 0x99, 0x00, 0x00, 0x00, 0x00]).unwrap();
    connection.handle_message(unknown).await;

    let nack = next_sent(&mut handle).await;
    assert_eq!(
        nack.diagnostic_nack_code(),
        Some(DiagnosticNackCode::TransportProtocolError)
    );
    assert_eq!(connection.state(), ConnectionState::RoutingActivated);
    assert!(handle.is_active());
}

#[tokio::test(start_paused = true)]
async fn wrong_source_is_nacked_without_downstream_dispatch() {
    let log = Arc::new(ModelLog::default());
    let provider = Arc::new(CountingProvider::default());
    let (mut connection, mut handle) = new_connection(
        TestModel::with_provider(log.clone(), provider.clone()),
        fast_timers(),
    );
    activate(&mut connection, &mut handle).await;

    connection
        .handle_message(DoipMessage::diagnostic_message(0x0E99, SERVER, &[0x3E, 0x00]))
        .await;

    let nack = next_sent(&mut handle).await;
    assert_eq!(
        nack.diagnostic_nack_code(),
        Some(DiagnosticNackCode::InvalidSourceAddress)
    );
    assert_eq!(provider.dispatches.load(Ordering::SeqCst), 0);
    assert_eq!(log.diagnostics.load(Ordering::SeqCst), 0);
    assert_eq!(connection.state(), ConnectionState::RoutingActivated);
}

#[tokio::test(start_paused = true)]
async fn model_veto_sends_nack_and_skips_downstream() {
    let log = Arc::new(ModelLog::default());
    let (mut connection, mut handle) = new_connection(
        TestModel::with_veto(log.clone(), DiagnosticNackCode::UnknownTargetAddress),
        fast_timers(),
    );
    activate(&mut connection, &mut handle).await;

    connection
        .handle_message(DoipMessage::diagnostic_message(CLIENT, SERVER, &[0x3E, 0x00]))
        .await;

    let nack = next_sent(&mut handle).await;
    assert_eq!(
        nack.diagnostic_nack_code(),
        Some(DiagnosticNackCode::UnknownTargetAddress)
    );
    assert_eq!(
        *log.acks.lock(),
        vec![Some(DiagnosticNackCode::UnknownTargetAddress)]
    );
    assert_eq!(connection.state(), ConnectionState::RoutingActivated);
}

#[tokio::test(start_paused = true)]
async fn refused_downstream_maps_to_target_unreachable() {
    let log = Arc::new(ModelLog::default());
    let provider = Arc::new(MockUdsProvider::new(&MockUdsConfig::default()));
    provider.set_mode(MockUdsMode::Refuse);
    let (mut connection, mut handle) =
        new_connection(TestModel::with_provider(log, provider), fast_timers());
    activate(&mut connection, &mut handle).await;

    connection
        .handle_message(DoipMessage::diagnostic_message(CLIENT, SERVER, &[0x3E, 0x00]))
        .await;

    let ack = next_sent(&mut handle).await;
    assert_eq!(ack.payload_type(), PayloadType::DiagnosticPositiveAck);
    let nack = next_sent(&mut handle).await;
    assert_eq!(
        nack.diagnostic_nack_code(),
        Some(DiagnosticNackCode::TargetUnreachable)
    );
    assert_eq!(connection.state(), ConnectionState::RoutingActivated);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_with_single_notification() {
    let log = Arc::new(ModelLog::default());
    let (mut connection, handle) = new_connection(TestModel::new(log.clone()), fast_timers());

    connection.close(CloseReason::ApplicationRequest).await;
    connection.close(CloseReason::SocketError).await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!handle.is_active());
    assert_eq!(*log.closes.lock(), vec![CloseReason::ApplicationRequest]);
}

// === event loop tests ===

struct Running {
    handle: MockConnectionHandle,
    log: Arc<ModelLog>,
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_connection(model: TestModel, timers: TimerConfig, log: Arc<ModelLog>) -> Running {
    let (transport, handle) = MockConnectionTransport::pair("mock:client");
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connection = Connection::new(
        Box::new(transport),
        Box::new(model),
        TimerManager::new(),
        timers,
    );
    let task = tokio::spawn(async move { connection.run(stop_rx).await });
    Running {
        handle,
        log,
        stop_tx,
        task,
    }
}

#[tokio::test(start_paused = true)]
async fn initial_inactivity_closes_the_connection() {
    let log = Arc::new(ModelLog::default());
    let mut running = spawn_connection(TestModel::new(log.clone()), fast_timers(), log);

    advance(Duration::from_millis(2_100)).await;
    let log = running.log.clone();
    wait_until(move || log.closes.lock().len() == 1).await;

    assert_eq!(
        *running.log.closes.lock(),
        vec![CloseReason::InitialInactivityTimeout]
    );
    assert!(!running.handle.is_active());
    running.task.await.unwrap();
    running.stop_tx.send(true).ok();
}

#[tokio::test(start_paused = true)]
async fn inactivity_triggers_alive_check_and_response_recovers() {
    let log = Arc::new(ModelLog::default());
    let mut running = spawn_connection(TestModel::new(log.clone()), fast_timers(), log);

    running
        .handle
        .inject(DoipMessage::parse(&ACTIVATION_REQUEST).unwrap());
    let response = next_sent(&mut running.handle).await;
    assert_eq!(response.to_bytes(), ACTIVATION_RESPONSE);

    // 500 ms of silence: the server probes.
    let probe = next_sent(&mut running.handle).await;
    assert_eq!(
        probe.to_bytes(),
        [0x02, 0xFD, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00]
    );

    running.handle.inject(DoipMessage::alive_check_response(CLIENT));

    // Back in the activated state: the next silence probes again rather
    // than closing.
    let probe = next_sent(&mut running.handle).await;
    assert_eq!(probe.payload_type(), PayloadType::AliveCheckRequest);
    assert!(running.log.closes.lock().is_empty());

    running.stop_tx.send(true).ok();
    running.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn alive_check_exhaustion_closes() {
    let log = Arc::new(ModelLog::default());
    let mut running = spawn_connection(TestModel::new(log.clone()), fast_timers(), log);

    running
        .handle
        .inject(DoipMessage::parse(&ACTIVATION_REQUEST).unwrap());
    next_sent(&mut running.handle).await; // activation response

    // Three probes, no answer, then the connection is gone.
    for _ in 0..3 {
        let probe = next_sent(&mut running.handle).await;
        assert_eq!(probe.payload_type(), PayloadType::AliveCheckRequest);
    }

    let log = running.log.clone();
    wait_until(move || log.closes.lock().len() == 1).await;
    assert_eq!(
        *running.log.closes.lock(),
        vec![CloseReason::AliveCheckTimeout]
    );
    assert!(!running.handle.is_active());
    running.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn downstream_roundtrip_reaches_the_client() {
    let log = Arc::new(ModelLog::default());
    let provider = Arc::new(MockUdsProvider::new(&MockUdsConfig::default()));
    let mut running = spawn_connection(
        TestModel::with_provider(log.clone(), provider),
        fast_timers(),
        log,
    );

    running
        .handle
        .inject(DoipMessage::parse(&ACTIVATION_REQUEST).unwrap());
    next_sent(&mut running.handle).await;

    running
        .handle
        .inject(DoipMessage::diagnostic_message(CLIENT, SERVER, &[0x3E, 0x00]));

    let ack = next_sent(&mut running.handle).await;
    assert_eq!(ack.payload_type(), PayloadType::DiagnosticPositiveAck);

    let reply = next_sent(&mut running.handle).await;
    assert_eq!(reply.payload_type(), PayloadType::DiagnosticMessage);
    assert_eq!(reply.source_address(), Some(SERVER));
    assert_eq!(reply.target_address(), Some(CLIENT));
    assert_eq!(reply.user_data(), Some(&[0x7E, 0x00][..]));

    running.stop_tx.send(true).ok();
    running.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_downstream_times_out_and_recovers() {
    let log = Arc::new(ModelLog::default());
    let provider = Arc::new(MockUdsProvider::new(&MockUdsConfig::default()));
    provider.set_mode(MockUdsMode::Silent);
    let mut running = spawn_connection(
        TestModel::with_provider(log.clone(), provider.clone()),
        fast_timers(),
        log,
    );

    running
        .handle
        .inject(DoipMessage::parse(&ACTIVATION_REQUEST).unwrap());
    next_sent(&mut running.handle).await;

    running
        .handle
        .inject(DoipMessage::diagnostic_message(CLIENT, SERVER, &[0x22, 0xF1, 0x90]));
    let ack = next_sent(&mut running.handle).await;
    assert_eq!(ack.payload_type(), PayloadType::DiagnosticPositiveAck);

    // The 2 s downstream timer elapses without a response.
    let nack = next_sent(&mut running.handle).await;
    assert_eq!(
        nack.diagnostic_nack_code(),
        Some(DiagnosticNackCode::TargetUnreachable)
    );

    // Recovered: the connection still accepts diagnostic messages.
    provider.set_mode(MockUdsMode::Respond);
    running
        .handle
        .inject(DoipMessage::diagnostic_message(CLIENT, SERVER, &[0x3E, 0x00]));
    let ack = next_sent(&mut running.handle).await;
    assert_eq!(ack.payload_type(), PayloadType::DiagnosticPositiveAck);

    running.stop_tx.send(true).ok();
    running.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_signal_closes_with_application_request() {
    let log = Arc::new(ModelLog::default());
    let running = spawn_connection(TestModel::new(log.clone()), fast_timers(), log.clone());

    running.stop_tx.send(true).unwrap();
    running.task.await.unwrap();

    assert_eq!(*log.closes.lock(), vec![CloseReason::ApplicationRequest]);
    assert!(!running.handle.is_active());
}

#[tokio::test(start_paused = true)]
async fn peer_disconnect_closes_with_peer_reason() {
    let log = Arc::new(ModelLog::default());
    let mut running = spawn_connection(TestModel::new(log.clone()), fast_timers(), log.clone());

    running
        .handle
        .inject(DoipMessage::parse(&ACTIVATION_REQUEST).unwrap());
    next_sent(&mut running.handle).await;

    running.handle.disconnect();
    running.task.await.unwrap();

    assert_eq!(*log.closes.lock(), vec![CloseReason::PeerDisconnect]);
    running.stop_tx.send(true).ok();
}
