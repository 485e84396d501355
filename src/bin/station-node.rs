//! Host-based station node for development and testing.
//!
//! Runs the same station/provisioning composition as the firmware, over the
//! simulated radio and the JSON credential store.
//!
//! # Usage
//!
//! ```bash
//! # Access points "in range": comma separated ssid:password pairs
//! SIM_NETWORKS="Home:password123,Cafe:" cargo run --bin station-node
//!
//! # Credential the simulated phone delivers if provisioning is needed
//! SIM_NETWORKS="Home:password123" WIFI_SSID="Home" WIFI_PASSWORD="password123" \
//!     cargo run --bin station-node
//! ```

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use wifi_station_esp32::config::{Credential, ProvisioningConfig, StationConfig};
use wifi_station_esp32::credentials::CredentialStore;
use wifi_station_esp32::sim::{SimNetwork, SimProvisioner, SimRadio};
use wifi_station_esp32::storage::{default_store_path, FileStore};
use wifi_station_esp32::wifi::{
    ConnectionManager, EventBus, ExitRestarter, LogStatus, ProvisioningOutcome,
    ProvisioningSession, StationOutcome,
};

/// Environment variable listing simulated access points.
const ENV_SIM_NETWORKS: &str = "SIM_NETWORKS";

/// How often the connection status is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn sim_networks() -> Vec<SimNetwork> {
    let Ok(raw) = std::env::var(ENV_SIM_NETWORKS) else {
        return Vec::new();
    };
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((ssid, password)) => SimNetwork::new(ssid.trim(), password),
            None => SimNetwork::new(entry.trim(), ""),
        })
        .collect()
}

fn provisioned_credential() -> Option<Credential> {
    let ssid = std::env::var("WIFI_SSID").ok()?;
    let password = std::env::var("WIFI_PASSWORD").unwrap_or_default();
    match Credential::new(ssid, password) {
        Ok(credential) => Some(credential),
        Err(e) => {
            warn!("Ignoring WIFI_SSID/WIFI_PASSWORD: {}", e);
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== WiFi Station Node (host) starting ===");

    let path = match default_store_path() {
        Ok(path) => path,
        Err(e) => {
            error!("Cannot locate credential store: {}", e);
            std::process::exit(1);
        }
    };
    let storage = match FileStore::open(&path) {
        Ok(storage) => storage,
        Err(e) => {
            error!("Cannot open credential store: {}", e);
            std::process::exit(1);
        }
    };
    info!("Credential store: {}", path.display());

    // Halt rather than run with a table we cannot read
    let mut store = CredentialStore::open(storage);
    if let Err(e) = store.load() {
        error!("Cannot load stored networks: {}", e);
        std::process::exit(1);
    }
    let store = store.shared();

    let bus = EventBus::new();
    let radio = SimRadio::new(bus.clone());
    for network in sim_networks() {
        info!("Simulated AP in range: {}", network.ssid);
        radio.add_network(network);
    }

    let mut manager = ConnectionManager::new(
        radio.clone(),
        Arc::clone(&store),
        bus.clone(),
        StationConfig::from_env(),
    );

    let outcome = tokio::select! {
        outcome = manager.start() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            return;
        }
    };

    match outcome {
        Ok(StationOutcome::Connected { ssid, ip, .. }) => {
            info!("Online via {} ({})", ssid, ip);
        }
        Ok(other) => {
            warn!("No usable network ({:?}), starting provisioning", other);
            drop(manager);
            provision(radio, store, bus).await;
            return;
        }
        Err(e) => {
            error!("Station flow failed: {}", e);
            std::process::exit(1);
        }
    }

    info!("Entering main loop (Ctrl+C to exit)...");
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await; // Skip first
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.signal_strength() {
                    Ok(rssi) => info!("Status: {} ({} dBm)", manager.status(), rssi),
                    Err(_) => info!("Status: {}", manager.status()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
}

async fn provision(
    radio: SimRadio,
    store: wifi_station_esp32::SharedStore<FileStore>,
    bus: EventBus,
) {
    let provisioner = SimProvisioner::new(bus.clone());
    match provisioned_credential() {
        Some(credential) => provisioner.queue(credential, None),
        None => warn!("WIFI_SSID not set: the simulated phone will not send anything"),
    }

    let config = ProvisioningConfig::default();
    let restart_delay = config.restart_delay;
    let mut session = ProvisioningSession::new(
        radio,
        provisioner.clone(),
        store,
        bus,
        Arc::new(ExitRestarter),
        Arc::new(LogStatus),
        config,
    );

    let outcome = tokio::select! {
        outcome = session.start() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            return;
        }
    };

    match outcome {
        Ok(ProvisioningOutcome::Provisioned { slot, ssid, ip }) => {
            info!("Provisioned {} into slot {} ({})", ssid, slot, ip);
            provisioner.acknowledge();
        }
        Ok(ProvisioningOutcome::ConnectFailed { ssid }) => {
            warn!("Provisioned network {} never connected", ssid);
        }
        Err(e) => error!("Provisioning failed: {}", e),
    }

    // The restarter exits the process; keep the session alive until then
    tokio::time::sleep(restart_delay * 2).await;
}
