//! Deskemes phone agent entry point.
//!
//! Wires together the beacon listener, the connection manager and the
//! pairing workflow, then runs until Ctrl+C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load config, ensure a public ID, open the trust store
//!  └─ start services
//!       ├─ beacon listener   (UDP std thread)
//!       │     └─ BlacklistFilter ─► ManagerHandle
//!       ├─ ConnectionManager (Tokio task, owns every connection)
//!       └─ event pump        (Tokio task, feeds PairingWorkflow)
//! ```
//!
//! # Usage
//!
//! ```text
//! deskemes-agent [OPTIONS]
//!
//! Options:
//!   --config <PATH>          Config file [env: DESKEMES_CONFIG]
//!   --connect <ADDR>         Dial a desktop directly (repeatable) [env: DESKEMES_CONNECT]
//!   --friendly-name <NAME>   Override the configured device name
//!   --auto-approve           Approve every pairing request without asking
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use deskemes_agent::application::pairing::{
    Approver, AutoApprover, ConsoleApprover, PairingWorkflow,
};
use deskemes_agent::application::services::{
    LogOnlyTextSender, ServiceRegistry, StaticDeviceInfo,
};
use deskemes_agent::infrastructure::network::beacon_listener::{
    start_beacon_listener, AddressBlacklist, BeaconListenerConfig, BlacklistFilter,
};
use deskemes_agent::infrastructure::network::connection::LocalIdentity;
use deskemes_agent::infrastructure::network::manager::{
    ConnectionManager, ManagerConfig, ManagerEvent,
};
use deskemes_agent::infrastructure::storage::config::{
    config_file_path, load_config_from, save_config_to, AgentConfig,
};
use deskemes_agent::infrastructure::storage::trust_store::{ApprovedPeers, FilePeerStore};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Deskemes phone agent.
///
/// Listens for desktop beacons, pairs with desktops and serves mux channels
/// over TLS.
#[derive(Debug, Parser)]
#[command(
    name = "deskemes-agent",
    about = "Phone-side Deskemes connectivity engine",
    version
)]
struct Cli {
    /// Config file; defaults to the platform config directory.
    #[arg(long, env = "DESKEMES_CONFIG")]
    config: Option<PathBuf>,

    /// Desktop address to dial at startup, e.g. `192.168.1.20:4817`.
    #[arg(long = "connect", value_name = "ADDR", env = "DESKEMES_CONNECT", value_delimiter = ',')]
    connect: Vec<SocketAddr>,

    /// Name sent to desktops instead of the configured one.
    #[arg(long, env = "DESKEMES_FRIENDLY_NAME")]
    friendly_name: Option<String>,

    /// Approve every pairing request without asking.
    #[arg(long, env = "DESKEMES_AUTO_APPROVE")]
    auto_approve: bool,
}

/// Loads the config, generating and saving a public ID on first run.
fn load_agent_config(cli: &Cli) -> anyhow::Result<(AgentConfig, PathBuf)> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config_file_path()?,
    };
    let mut config = load_config_from(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    let (_, generated) = config.device.ensure_public_id();
    if generated {
        save_config_to(&path, &config)
            .with_context(|| format!("saving config to {}", path.display()))?;
    }
    if let Some(name) = &cli.friendly_name {
        config.device.friendly_name = name.clone();
    }
    Ok((config, path))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, config_path) = load_agent_config(&cli)?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.device.log_level)),
        )
        .init();

    let public_id = config
        .device
        .public_id
        .clone()
        .context("config has no public ID")?;
    info!(
        "Deskemes agent \"{}\" ({public_id}) starting with {}",
        config.device.friendly_name,
        config_path.display()
    );

    // ── Trust store ───────────────────────────────────────────────────────────
    let trust_path = config.trust_store_path(&config_path);
    let trust = Arc::new(
        ApprovedPeers::open(FilePeerStore::new(&trust_path))
            .with_context(|| format!("opening trust store {}", trust_path.display()))?,
    );
    info!("Loaded {} known desktop(s) from {}", trust.len(), trust_path.display());

    // ── Connection manager ────────────────────────────────────────────────────
    let registry = ServiceRegistry::with_default_services(
        Arc::new(StaticDeviceInfo::default()),
        Arc::new(LogOnlyTextSender::default()),
    );
    let blacklist = Arc::new(AddressBlacklist::new());
    let timeout_secs = config.network.handshake_timeout_secs;
    let manager_config = ManagerConfig {
        respond_to_discovery: config.device.respond_to_discovery,
        handshake_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        ..ManagerConfig::new(LocalIdentity {
            friendly_name: config.device.friendly_name.clone(),
            public_id: public_id.clone(),
        })
    };
    let (manager, handle, mut events) =
        ConnectionManager::new(manager_config, trust.clone(), registry, Arc::clone(&blacklist));
    let manager_task = tokio::spawn(manager.run());

    // ── Beacon listener ───────────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let listener_config = BeaconListenerConfig {
        primary_port: config.network.primary_port,
        fallback_port: config.network.fallback_port,
        max_datagram_size: config.network.max_datagram_size,
    };
    let consumer = Arc::new(BlacklistFilter::new(Arc::clone(&blacklist), handle.clone()));
    match start_beacon_listener(listener_config, consumer, Arc::clone(&running)) {
        Ok(addr) => info!("Listening for beacons on UDP {addr}"),
        Err(e) => error!("Beacon listener not started: {e}"),
    }

    for addr in &cli.connect {
        handle.connect_to(*addr)?;
    }

    // ── Event pump ────────────────────────────────────────────────────────────
    let approver: Arc<dyn Approver> = if cli.auto_approve {
        Arc::new(AutoApprover)
    } else {
        Arc::new(ConsoleApprover)
    };
    let workflow = Arc::new(PairingWorkflow::new(
        trust,
        Arc::new(handle.clone()),
        approver,
        public_id,
    ));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ManagerEvent::PairingRequired(request) => {
                    let workflow = Arc::clone(&workflow);
                    tokio::spawn(async move {
                        // Failures are logged by the workflow.
                        let _ = workflow.handle(request).await;
                    });
                }
                ManagerEvent::Connected { id, addr } => debug!("Connection {id} to {addr} open"),
                ManagerEvent::Encrypted { id } => info!("Connection {id} is encrypted"),
                ManagerEvent::Closed { id, addr, reason } => {
                    debug!("Connection {id} to {addr} gone: {reason}");
                }
            }
        }
    });

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    info!("Deskemes agent ready.  Press Ctrl-C to exit.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!("Failed to listen for Ctrl+C: {e}"),
    }
    running.store(false, Ordering::Relaxed);
    if handle.shutdown().is_ok() {
        let _ = manager_task.await;
    }

    info!("Deskemes agent stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_have_no_targets_and_ask_for_approval() {
        // Arrange / Act
        let cli = Cli::parse_from(["deskemes-agent"]);

        // Assert
        assert!(cli.connect.is_empty());
        assert!(!cli.auto_approve);
    }

    #[test]
    fn test_connect_is_repeatable() {
        let cli = Cli::parse_from([
            "deskemes-agent",
            "--connect",
            "192.168.1.20:4817",
            "--connect",
            "10.0.0.5:4817",
        ]);

        assert_eq!(cli.connect.len(), 2);
        assert_eq!(cli.connect[1], "10.0.0.5:4817".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_load_agent_config_generates_and_saves_public_id() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("deskemes-main-{}", std::process::id()));
        let path = dir.join("config.toml");
        let _ = std::fs::remove_file(&path);
        let cli = Cli::parse_from([
            "deskemes-agent",
            "--config",
            path.to_str().unwrap(),
            "--friendly-name",
            "Pixel",
        ]);

        // Act
        let (config, _) = load_agent_config(&cli).unwrap();
        let (again, _) = load_agent_config(&cli).unwrap();

        // Assert
        assert!(config.device.public_id.is_some());
        assert_eq!(config.device.public_id, again.device.public_id);
        assert_eq!(config.device.friendly_name, "Pixel");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
