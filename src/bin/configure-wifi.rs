//! WiFi credential utility.
//!
//! Adds, lists and forgets entries of the three-slot credential table.
//!
//! On the host the table lives in the JSON store (`WIFI_STATION_STORE`, or
//! `~/.wifi-station-esp32/credentials.json`):
//!
//! ```bash
//! WIFI_SSID="MyNetwork" WIFI_PASSWORD="secret" cargo run --bin configure-wifi -- add
//! cargo run --bin configure-wifi -- list
//! cargo run --bin configure-wifi -- forget 1
//! ```
//!
//! On ESP32 the command and credentials are baked in at compile time and
//! written to NVS:
//!
//! ```bash
//! WIFI_SSID="MyNetwork" WIFI_PASSWORD="secret" cargo run --bin configure-wifi --features esp32
//! WIFI_COMMAND="forget" WIFI_SLOT="1" cargo run --bin configure-wifi --features esp32
//! ```

use wifi_station_esp32::config::{ConfigCommand, ConfigError, Credential};
use wifi_station_esp32::credentials::{CredentialStore, SLOT_COUNT};
use wifi_station_esp32::storage::KvStore;

/// Print error message and halt. On ESP32, we pause briefly first so the
/// serial monitor shows the output.
fn halt_with_error(msg: &str) -> ! {
    eprintln!("\n{}", msg);
    eprintln!("\n=== Configuration failed ===\n");
    #[cfg(feature = "esp32")]
    std::thread::sleep(std::time::Duration::from_secs(2));
    std::process::exit(1);
}

fn credential_from(ssid: Option<&str>, password: Option<&str>) -> Credential {
    let ssid = match ssid {
        Some(s) if !s.is_empty() => s,
        _ => halt_with_error(
            "Error: WIFI_SSID not set.\n\n\
             Usage:\n  \
             WIFI_SSID=\"MyNetwork\" WIFI_PASSWORD=\"secret\" configure-wifi add\n\n\
             For open networks:\n  \
             WIFI_SSID=\"OpenNetwork\" WIFI_PASSWORD=\"\" configure-wifi add",
        ),
    };
    let password = password.unwrap_or("");

    println!("SSID: {}", ssid);
    println!(
        "Password: {} ({} chars)",
        if password.is_empty() { "(none)" } else { "****" },
        password.len()
    );

    match Credential::new(ssid, password) {
        Ok(credential) => credential,
        Err(ConfigError::SsidTooLong { len, max }) => halt_with_error(&format!(
            "Error: SSID too long ({} bytes, max {})",
            len, max
        )),
        Err(ConfigError::PasswordTooLong { len, max }) => halt_with_error(&format!(
            "Error: Password too long ({} bytes, max {})",
            len, max
        )),
        Err(e) => halt_with_error(&format!("Error: {}", e)),
    }
}

fn parse_slot(arg: Option<&str>) -> usize {
    match arg.map(str::parse::<usize>) {
        Some(Ok(slot)) if slot < SLOT_COUNT => slot,
        _ => halt_with_error(&format!(
            "Error: forget needs a slot number (0-{})",
            SLOT_COUNT - 1
        )),
    }
}

fn print_slots<S: KvStore>(store: &CredentialStore<S>) {
    println!("\nStored networks:");
    for (index, slot) in store.slots().iter().enumerate() {
        match slot.ssid() {
            Some(ssid) => println!("  [{}] {:<32} score {:>3}", index, ssid, slot.score),
            None => println!("  [{}] (empty)", index),
        }
    }
}

/// Apply `command` to the table in `storage`.
fn run<S: KvStore>(
    storage: S,
    command: ConfigCommand,
    credential: impl FnOnce() -> Credential,
    slot: impl FnOnce() -> usize,
) {
    let mut store = CredentialStore::open(storage);
    if let Err(e) = store.load() {
        halt_with_error(&format!("Error loading stored networks: {}", e));
    }

    match command {
        ConfigCommand::Add => {
            let credential = credential();
            let index = store.find_slot_for_write(&credential.ssid);
            if let Some(evicted) = store.slot(index).and_then(|s| s.ssid()) {
                if evicted != credential.ssid {
                    println!("Replacing {} (lowest score)", evicted);
                }
            }
            match store.write(index, &credential) {
                Ok(()) => println!("\n=== Saved to slot {} ===", index),
                Err(e) => halt_with_error(&format!("Error saving credentials: {}", e)),
            }
        }
        ConfigCommand::List => {}
        ConfigCommand::Forget => {
            let index = slot();
            match store.forget(index) {
                Ok(true) => println!("\n=== Slot {} cleared ===", index),
                Ok(false) => println!("\nSlot {} was already empty", index),
                Err(e) => halt_with_error(&format!("Error clearing slot: {}", e)),
            }
        }
    }

    print_slots(&store);
}

#[cfg(feature = "esp32")]
fn main() {
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use wifi_station_esp32::storage::{init_nvs, NvsStore};

    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    println!("\n=== WiFi Configuration Utility ===\n");

    let command = match option_env!("WIFI_COMMAND").unwrap_or("add").parse() {
        Ok(command) => command,
        Err(e) => halt_with_error(&format!("Error: {}", e)),
    };

    let nvs = match EspDefaultNvsPartition::take().and_then(init_nvs) {
        Ok(nvs) => nvs,
        Err(e) => halt_with_error(&format!("Error initializing NVS: {:?}", e)),
    };

    run(
        NvsStore::new(nvs),
        command,
        || credential_from(option_env!("WIFI_SSID"), option_env!("WIFI_PASSWORD")),
        || parse_slot(option_env!("WIFI_SLOT")),
    );

    println!("\n=== Done - you can disconnect the device ===\n");

    // Brief pause to ensure serial output is visible, then exit cleanly
    std::thread::sleep(std::time::Duration::from_secs(2));
}

#[cfg(not(feature = "esp32"))]
fn main() {
    use wifi_station_esp32::storage::{default_store_path, FileStore};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match args.first().map(|a| a.parse::<ConfigCommand>()) {
        Some(Ok(command)) => command,
        Some(Err(e)) => halt_with_error(&format!("Error: {}", e)),
        None => halt_with_error(
            "Usage:\n  \
             WIFI_SSID=\"MyNetwork\" WIFI_PASSWORD=\"secret\" configure-wifi add\n  \
             configure-wifi list\n  \
             configure-wifi forget <slot>",
        ),
    };

    let path = match default_store_path() {
        Ok(path) => path,
        Err(e) => halt_with_error(&format!("Error locating store: {}", e)),
    };
    let storage = match FileStore::open(&path) {
        Ok(storage) => storage,
        Err(e) => halt_with_error(&format!("Error opening {:?}: {}", path, e)),
    };
    println!("Store: {}", path.display());

    let ssid = std::env::var("WIFI_SSID").ok();
    let password = std::env::var("WIFI_PASSWORD").ok();
    run(
        storage,
        command,
        || credential_from(ssid.as_deref(), password.as_deref()),
        || parse_slot(args.get(1).map(String::as_str)),
    );
}
