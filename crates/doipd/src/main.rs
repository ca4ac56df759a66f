//! doipd - DoIP gateway server daemon
//!
//! Announces a vehicle on the local segment, accepts diagnostic clients
//! over TCP and brokers UDS payloads to a downstream provider (mock, or
//! ISO-TP over SocketCAN with the `isotp` feature).
//!
//! ```bash
//! # Loopback demo against the mock provider
//! doipd --loopback --vin WAUZZZ8V9KA123456 --address 0x0028
//!
//! # Production style with a config file, daemonized
//! doipd --config /etc/doipd.toml --daemon --pidfile /run/doipd.pid
//! ```

mod daemon;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use doip_gateway::config::{DownstreamConfig, ServerConfig};
use doip_gateway::downstream::mock::MockUdsProvider;
use doip_gateway::downstream::DownstreamProvider;
use doip_gateway::model::DownstreamServerModel;
use doip_gateway::server::DoipServer;

#[derive(Parser, Debug)]
#[command(name = "doipd")]
#[command(about = "DoIP gateway server daemon")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Run in the background (double fork, detach from the terminal)
    #[arg(long)]
    daemon: bool,

    /// PID file path
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Trace-level logging (overrides --verbose)
    #[arg(long)]
    trace: bool,

    /// Vehicle identification number (17 characters)
    #[arg(long)]
    vin: Option<String>,

    /// Gateway logical address, e.g. 0x0028
    #[arg(long)]
    address: Option<String>,

    /// Announce on loopback instead of broadcast
    #[arg(long)]
    loopback: bool,
}

/// Top-level daemon configuration file.
#[derive(Debug, Default, Deserialize)]
struct DaemonConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    downstream: DownstreamConfig,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("doipd: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = apply_overrides(&mut config.server, &args) {
        eprintln!("doipd: {e}");
        return ExitCode::from(1);
    }

    // Fork before the runtime, sockets or logger sinks exist; the
    // subscriber is installed in the daemonized child.
    if args.daemon {
        if let Err(e) = daemon::daemonize() {
            eprintln!("doipd: failed to daemonize: {e}");
            return ExitCode::from(1);
        }
    }

    init_tracing(&args);

    if let Some(pidfile) = &args.pidfile {
        if let Err(e) = daemon::write_pidfile(pidfile) {
            tracing::error!(%e, "Failed to write PID file");
            return ExitCode::from(1);
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(%e, "Failed to start runtime");
            return ExitCode::from(2);
        }
    };
    let code = runtime.block_on(run(config));

    if let Some(pidfile) = &args.pidfile {
        daemon::remove_pidfile(pidfile);
    }
    code
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let Some(path) = &args.config else {
        return Ok(DaemonConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"))?;
    Ok(toml::from_str(&content)?)
}

fn apply_overrides(config: &mut ServerConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(vin) = &args.vin {
        config.vin = vin.clone();
    }
    if let Some(address) = &args.address {
        config.logical_address = parse_hex_address(address)?;
    }
    if args.loopback {
        config.loopback = true;
    }
    Ok(())
}

fn parse_hex_address(s: &str) -> anyhow::Result<u16> {
    let digits = s
        .trim()
        .strip_prefix("0x")
        .or_else(|| s.trim().strip_prefix("0X"))
        .unwrap_or(s.trim());
    u16::from_str_radix(digits, 16).map_err(|e| anyhow::anyhow!("invalid address {s:?}: {e}"))
}

fn init_tracing(args: &Args) {
    let default_level = if args.trace {
        "doipd=trace,doip_gateway=trace,doip_wire=trace"
    } else if args.verbose {
        "doipd=debug,doip_gateway=debug"
    } else {
        "doipd=info,doip_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();
}

fn build_provider(
    config: &DownstreamConfig,
) -> anyhow::Result<Arc<dyn DownstreamProvider>> {
    match config {
        DownstreamConfig::Mock(cfg) => Ok(Arc::new(MockUdsProvider::new(cfg))),
        #[cfg(all(target_os = "linux", feature = "isotp"))]
        DownstreamConfig::IsoTp(cfg) => Ok(Arc::new(
            doip_gateway::downstream::isotp::IsoTpProvider::new(cfg),
        )),
        #[cfg(not(all(target_os = "linux", feature = "isotp")))]
        DownstreamConfig::IsoTp(_) => Err(anyhow::anyhow!(
            "ISO-TP downstream requires Linux and the 'isotp' feature"
        )),
    }
}

async fn run(config: DaemonConfig) -> ExitCode {
    tracing::info!("Starting doipd");

    let provider = match build_provider(&config.downstream) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::error!(%e, "Invalid downstream configuration");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = provider.start() {
        tracing::error!(%e, "Failed to start downstream provider");
        return ExitCode::from(1);
    }

    let server = match DoipServer::with_tcp(config.server.clone()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(%e, "Invalid server configuration");
            provider.stop();
            return ExitCode::from(1);
        }
    };
    if let Err(e) = server.setup().await {
        tracing::error!(%e, "Server setup failed");
        provider.stop();
        return ExitCode::from(1);
    }

    let address = config.server.logical_address;
    let model_provider = provider.clone();
    server.start(Arc::new(move || {
        Box::new(DownstreamServerModel::new(
            "doipd",
            address,
            model_provider.clone(),
        ))
    }));
    tracing::info!(
        vin = %config.server.vin,
        address = format_args!("0x{address:04X}"),
        tcp_port = config.server.tcp_port,
        "Gateway up"
    );

    let code = match wait_for_shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(%e, "Signal handling failed");
            ExitCode::from(2)
        }
    };

    server.stop().await;
    provider.stop();
    tracing::info!("doipd stopped");
    code
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_address_parses_with_and_without_prefix() {
        assert_eq!(parse_hex_address("0x0028").unwrap(), 0x0028);
        assert_eq!(parse_hex_address("0E80").unwrap(), 0x0E80);
        assert!(parse_hex_address("zz").is_err());
    }

    #[test]
    fn daemon_config_parses_sections() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [server]
            vin = "WAUZZZ8V9KA123456"
            logical_address = 0x0028
            loopback = true

            [downstream]
            type = "mock"
            latency_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.server.logical_address, 0x0028);
        assert!(matches!(config.downstream, DownstreamConfig::Mock(_)));
    }
}
