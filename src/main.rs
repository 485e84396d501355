//! WiFi station ESP32 firmware binary.
//!
//! Joins the best stored network in range; with none usable, waits for
//! credentials over ESP-Touch smart-config, stores them and restarts.

#[cfg(feature = "esp32")]
#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();

    // Initialize ESP-IDF logger for log crate integration
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("=== WiFi station starting ===");

    if let Err(e) = firmware::run().await {
        log::error!("Fatal: {}", e);
        log::error!("Restarting in 10 seconds...");
        std::thread::sleep(std::time::Duration::from_secs(10));
        esp_idf_hal::reset::restart();
    }
}

#[cfg(feature = "esp32")]
mod firmware {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::{info, warn};
    use std::sync::Arc;
    use std::time::Duration;
    use wifi_station_esp32::config::{ProvisioningConfig, StationConfig};
    use wifi_station_esp32::credentials::CredentialStore;
    use wifi_station_esp32::storage::{init_nvs, NvsStore};
    use wifi_station_esp32::wifi::{
        ConnectionManager, EspRadio, EspRestarter, EventBus, LogStatus, ProvisioningSession,
        SmartConfigListener, StationOutcome,
    };

    /// How often the connection status is logged.
    const STATUS_INTERVAL: Duration = Duration::from_secs(30);

    pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let partition = EspDefaultNvsPartition::take()?;

        // Halt rather than run with a table we cannot read
        let mut store = CredentialStore::open(NvsStore::new(init_nvs(partition.clone())?));
        store.load()?;
        let store = store.shared();

        let bus = EventBus::new();
        let radio = EspRadio::new(peripherals.modem, sysloop, Some(partition), &bus)?;

        let mut manager = ConnectionManager::new(
            radio.clone(),
            Arc::clone(&store),
            bus.clone(),
            StationConfig::default(),
        );

        match manager.start().await? {
            StationOutcome::Connected { ssid, ip, .. } => {
                info!("Online via {} ({})", ssid, ip);
                if let Err(e) = manager.set_power_save(true) {
                    warn!("Power save unavailable: {}", e);
                }
            }
            other => {
                warn!("No usable network ({:?}), starting provisioning", other);
                drop(manager);

                let mut session = ProvisioningSession::new(
                    radio,
                    SmartConfigListener::new(&bus)?,
                    store,
                    bus,
                    Arc::new(EspRestarter),
                    Arc::new(LogStatus),
                    ProvisioningConfig::default(),
                );
                let outcome = session.start().await;
                info!("Provisioning finished: {:?}", outcome);

                // A restart is scheduled; keep the session alive to stop
                // smart-config once the phone is acknowledged
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        loop {
            tokio::time::sleep(STATUS_INTERVAL).await;
            match manager.signal_strength() {
                Ok(rssi) => info!("Status: {} ({} dBm)", manager.status(), rssi),
                Err(_) => info!("Status: {}", manager.status()),
            }
        }
    }
}

#[cfg(not(feature = "esp32"))]
fn main() {
    println!("This binary requires the 'esp32' feature.");
    println!("Use 'cargo run --bin station-node' for the host build.");
}
