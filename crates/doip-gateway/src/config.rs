//! Gateway configuration
//!
//! Loaded from a TOML file or built programmatically. Defaults follow
//! ISO 13400-2 (ports, announcement cadence) and the timing parameters
//! the standard leaves to the entity.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use doip_wire::{Eid, FurtherAction, Gid, Vin, DEFAULT_MAX_PAYLOAD, DOIP_PORT};

use crate::error::GatewayError;

/// Server identity, announcement and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 17-character vehicle identification number
    pub vin: String,
    /// Logical address of the gateway (e.g. 0x0028)
    pub logical_address: u16,
    /// Entity identifier broadcast in announcements
    #[serde(default)]
    pub eid: Eid,
    /// Group identifier broadcast in announcements
    #[serde(default)]
    pub gid: Gid,
    /// Further-action byte of the announcement (0x00 = none)
    #[serde(default)]
    pub further_action: u8,
    /// Number of vehicle announcements sent at startup
    #[serde(default = "default_announce_count")]
    pub announce_count: u32,
    /// Spacing between announcements in milliseconds
    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,
    /// Announce to 127.0.0.1 instead of 255.255.255.255
    #[serde(default)]
    pub loopback: bool,
    /// TCP data port
    #[serde(default = "default_doip_port")]
    pub tcp_port: u16,
    /// UDP discovery port the gateway listens on
    #[serde(default = "default_doip_port")]
    pub udp_port: u16,
    /// Destination port for vehicle announcements
    #[serde(default = "default_doip_port")]
    pub announce_port: u16,
    /// Upper bound for header-declared payload lengths
    #[serde(default = "default_max_payload")]
    pub max_payload: u32,
    /// Connection timing parameters
    #[serde(default)]
    pub timers: TimerConfig,
}

fn default_announce_count() -> u32 {
    3
}

fn default_announce_interval() -> u64 {
    500
}

fn default_doip_port() -> u16 {
    DOIP_PORT
}

fn default_max_payload() -> u32 {
    DEFAULT_MAX_PAYLOAD
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            vin: "00000000000000000".to_string(),
            logical_address: 0x0028,
            eid: [0; 6],
            gid: [0; 6],
            further_action: 0x00,
            announce_count: default_announce_count(),
            announce_interval_ms: default_announce_interval(),
            loopback: false,
            tcp_port: default_doip_port(),
            udp_port: default_doip_port(),
            announce_port: default_doip_port(),
            max_payload: default_max_payload(),
            timers: TimerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file.
    pub fn load(path: &str) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::InvalidConfig(format!("{path}: {e}")))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), GatewayError> {
        self.parsed_vin()?;
        if self.announce_count == 0 {
            return Err(GatewayError::InvalidConfig(
                "announce_count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn parsed_vin(&self) -> Result<Vin, GatewayError> {
        Vin::new(&self.vin).map_err(GatewayError::Wire)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn announced_further_action(&self) -> FurtherAction {
        match self.further_action {
            0x10 => FurtherAction::CentralSecurityRequired,
            _ => FurtherAction::NoFurtherAction,
        }
    }
}

/// Connection timing parameters (§10 of ISO 13400-2 leaves most of these
/// to the entity; defaults below are the ones the gateway ships with).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Grace period for the first routing activation request
    #[serde(default = "default_initial_inactivity")]
    pub initial_inactivity_ms: u64,
    /// Inactivity period after which an alive check is sent
    #[serde(default = "default_general_inactivity")]
    pub general_inactivity_ms: u64,
    /// Wait per alive check attempt
    #[serde(default = "default_alive_check")]
    pub alive_check_ms: u64,
    /// Alive check attempts before the connection is closed
    #[serde(default = "default_alive_check_retries")]
    pub alive_check_retries: u32,
    /// Wait for a downstream (vehicle bus) response
    #[serde(default = "default_downstream_response")]
    pub downstream_response_ms: u64,
}

fn default_initial_inactivity() -> u64 {
    2_000
}

fn default_general_inactivity() -> u64 {
    300_000
}

fn default_alive_check() -> u64 {
    500
}

fn default_alive_check_retries() -> u32 {
    3
}

fn default_downstream_response() -> u64 {
    2_000
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_inactivity_ms: default_initial_inactivity(),
            general_inactivity_ms: default_general_inactivity(),
            alive_check_ms: default_alive_check(),
            alive_check_retries: default_alive_check_retries(),
            downstream_response_ms: default_downstream_response(),
        }
    }
}

impl TimerConfig {
    pub fn initial_inactivity(&self) -> Duration {
        Duration::from_millis(self.initial_inactivity_ms)
    }

    pub fn general_inactivity(&self) -> Duration {
        Duration::from_millis(self.general_inactivity_ms)
    }

    pub fn alive_check(&self) -> Duration {
        Duration::from_millis(self.alive_check_ms)
    }

    pub fn downstream_response(&self) -> Duration {
        Duration::from_millis(self.downstream_response_ms)
    }
}

/// Downstream provider selection for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DownstreamConfig {
    /// Canned UDS responses, no vehicle bus
    Mock(MockUdsConfig),
    /// ISO-TP over SocketCAN (Linux only)
    IsoTp(IsoTpConfig),
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self::Mock(MockUdsConfig::default())
    }
}

/// Mock UDS provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockUdsConfig {
    /// Simulated bus latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

/// ISO-TP over SocketCAN settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoTpConfig {
    /// CAN interface name (e.g. "can0")
    pub interface: String,
    /// Transmit CAN ID (gateway -> ECU)
    pub tx_id: u32,
    /// Receive CAN ID (ECU -> gateway)
    pub rx_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_iso_ports() {
        let config = ServerConfig::default();
        assert_eq!(config.tcp_port, 13400);
        assert_eq!(config.udp_port, 13400);
        assert_eq!(config.timers.initial_inactivity_ms, 2_000);
        assert_eq!(config.timers.alive_check_retries, 3);
    }

    #[test]
    fn validate_rejects_short_vin() {
        let config = ServerConfig {
            vin: "SHORT".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_with_defaults() {
        let parsed: ServerConfig = toml::from_str(
            r#"
            vin = "WAUZZZ8V9KA123456"
            logical_address = 0x0028
            loopback = true
            "#,
        )
        .unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.logical_address, 0x0028);
        assert!(parsed.loopback);
        assert_eq!(parsed.announce_count, 3);
        assert_eq!(parsed.max_payload, 64 * 1024);
    }

    #[test]
    fn downstream_config_is_tagged() {
        let parsed: DownstreamConfig = toml::from_str(
            r#"
            type = "isotp"
            interface = "vcan0"
            tx_id = 0x18DA00F1
            rx_id = 0x18DAF100
            "#,
        )
        .unwrap();
        match parsed {
            DownstreamConfig::IsoTp(cfg) => assert_eq!(cfg.interface, "vcan0"),
            other => panic!("unexpected config: {other:?}"),
        }
    }
}
