//! Router daemon binary
//!
//! Runs the router side of the filter protocol: handles filter requests
//! from victims, counter-connection handshakes with peer routers, and
//! drives the local firewall.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aitf::{ComplianceMode, Config, FilterTransport, IptablesDriver, RouterEngine};
use clap::Parser;
use tokio::time::Instant;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// AITF router daemon
#[derive(Parser, Debug)]
#[command(name = "aitf-router", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Compliance mode override (comply, ignore or lie)
    #[arg(short, long)]
    mode: Option<ComplianceMode>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("AITF router starting");

    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!(
                    "Failed to load configuration from {}: {}",
                    config_path.display(),
                    e
                );
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    let auth = match config.authenticator() {
        Ok(auth) => Arc::new(auth),
        Err(e) => {
            error!("Cannot build authenticator: {}", e);
            std::process::exit(1);
        }
    };

    let bind_addr = match config.socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid bind address: {}", e);
            std::process::exit(1);
        }
    };

    let mode = args.mode.unwrap_or_else(|| config.mode());
    let mut engine = RouterEngine::new(auth, mode, Arc::new(IptablesDriver), config.timings());

    let (transport, mut rx) = match FilterTransport::bind(bind_addr, 256).await {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    info!(addr = %transport.local_addr(), %mode, "AITF router running, press Ctrl+C to exit");

    let started = Instant::now();
    let mut maintenance = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = maintenance.tick() => {
                engine.tick(started.elapsed().as_millis() as u64);
            }
            received = rx.recv() => {
                let Some(datagram) = received else {
                    error!("Receive channel closed");
                    break;
                };
                handle_datagram(&mut engine, &transport, datagram, started).await;
            }
        }
    }

    info!("AITF router shutdown complete");
}

async fn handle_datagram(
    engine: &mut RouterEngine,
    transport: &FilterTransport,
    datagram: aitf::ReceivedDatagram,
    started: Instant,
) {
    let SocketAddr::V4(from) = datagram.from else {
        warn!(from = %datagram.from, "ignoring non-IPv4 peer");
        return;
    };

    let msg = match aitf::FilterMessage::decode(&datagram.data) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(from = %from, error = %e, "discarding undecodable datagram");
            return;
        }
    };

    let now_ms = started.elapsed().as_millis() as u64;
    for outbound in engine.handle_message(*from.ip(), msg, now_ms) {
        if let Err(e) = transport.send_to_host(&outbound.msg, outbound.to).await {
            warn!(to = %outbound.to, error = %e, "send failed");
        }
    }
}
