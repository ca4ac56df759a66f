//! Mock UDS provider for tests and bench setups

use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::MockUdsConfig;
use crate::downstream::{DownstreamProvider, DownstreamResult, DownstreamSink};

/// How the mock reacts to dispatches. Tests flip this to exercise the
/// failure paths of the downstream sub-flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockUdsMode {
    /// Answer from the response table
    #[default]
    Respond,
    /// Refuse every request
    Refuse,
    /// Accept the request but never answer (downstream timeout path)
    Silent,
}

/// Canned-response UDS provider.
///
/// Looks up responses by exact match first, then by prefix, and falls back
/// to a bare positive response (SID + 0x40) for anything else.
pub struct MockUdsProvider {
    latency: Duration,
    mode: RwLock<MockUdsMode>,
    responses: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl MockUdsProvider {
    pub fn new(config: &MockUdsConfig) -> Self {
        Self {
            latency: Duration::from_millis(config.latency_ms),
            mode: RwLock::new(MockUdsMode::Respond),
            responses: RwLock::new(Self::default_responses()),
        }
    }

    pub fn set_mode(&self, mode: MockUdsMode) {
        *self.mode.write() = mode;
    }

    /// Register an additional request -> response mapping.
    pub fn add_response(&self, request: Vec<u8>, response: Vec<u8>) {
        self.responses.write().push((request, response));
    }

    fn default_responses() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            // DiagnosticSessionControl default/extended
            (vec![0x10, 0x01], vec![0x50, 0x01, 0x00, 0x19, 0x01, 0xF4]),
            (vec![0x10, 0x03], vec![0x50, 0x03, 0x00, 0x19, 0x01, 0xF4]),
            // TesterPresent
            (vec![0x3E, 0x00], vec![0x7E, 0x00]),
            // ReadDataByIdentifier - VIN
            (vec![0x22, 0xF1, 0x90], {
                let mut resp = vec![0x62, 0xF1, 0x90];
                resp.extend_from_slice(b"1HGCM82633A123456");
                resp
            }),
            // ReadDataByIdentifier - active session
            (vec![0x22, 0xF1, 0x86], vec![0x62, 0xF1, 0x86, 0x01]),
            // ECUReset - hard reset
            (vec![0x11, 0x01], vec![0x51, 0x01]),
        ]
    }

    fn find_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        let responses = self.responses.read();
        for (req, resp) in responses.iter() {
            if req == request {
                return Some(resp.clone());
            }
        }
        for (req, resp) in responses.iter() {
            if request.starts_with(req) {
                return Some(resp.clone());
            }
        }
        request.first().map(|sid| vec![sid.wrapping_add(0x40)])
    }
}

impl DownstreamProvider for MockUdsProvider {
    fn name(&self) -> &str {
        "mock-uds"
    }

    fn dispatch(&self, request: &[u8], sink: DownstreamSink) -> DownstreamResult {
        match *self.mode.read() {
            MockUdsMode::Refuse => return DownstreamResult::Error,
            MockUdsMode::Silent => return DownstreamResult::Pending,
            MockUdsMode::Respond => {}
        }

        let Some(response) = self.find_response(request) else {
            return DownstreamResult::Error;
        };

        debug!(request = ?request, response = ?response, "Mock UDS exchange");
        let latency = self.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            sink.respond(response, DownstreamResult::Handled);
        });
        DownstreamResult::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::DownstreamResponse;
    use tokio::sync::mpsc::unbounded_channel;

    fn sink() -> (DownstreamSink, tokio::sync::mpsc::UnboundedReceiver<DownstreamResponse>) {
        let (tx, rx) = unbounded_channel();
        (DownstreamSink::new(tx), rx)
    }

    #[tokio::test]
    async fn answers_known_request_via_sink() {
        let provider = MockUdsProvider::new(&MockUdsConfig::default());
        let (sink, mut rx) = sink();

        let result = provider.dispatch(&[0x3E, 0x00], sink);
        assert_eq!(result, DownstreamResult::Pending);

        let response = rx.recv().await.unwrap();
        assert_eq!(response.result, DownstreamResult::Handled);
        assert_eq!(response.payload, vec![0x7E, 0x00]);
    }

    #[tokio::test]
    async fn unknown_sid_gets_bare_positive_response() {
        let provider = MockUdsProvider::new(&MockUdsConfig::default());
        let (sink, mut rx) = sink();

        provider.dispatch(&[0x31, 0x01, 0xFF, 0x00], sink);
        let response = rx.recv().await.unwrap();
        assert_eq!(response.payload, vec![0x71]);
    }

    #[tokio::test]
    async fn refuse_mode_returns_error_without_responding() {
        let provider = MockUdsProvider::new(&MockUdsConfig::default());
        provider.set_mode(MockUdsMode::Refuse);
        let (sink, mut rx) = sink();

        assert_eq!(
            provider.dispatch(&[0x3E, 0x00], sink),
            DownstreamResult::Error
        );
        drop(provider);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sink_after_drop_is_silent() {
        let (sink, rx) = sink();
        drop(rx);
        // Must not panic.
        sink.respond(vec![0x7E, 0x00], DownstreamResult::Handled);
    }
}
