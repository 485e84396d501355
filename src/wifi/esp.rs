//! ESP-IDF adapters for the radio, smart-config listener and restart.
//!
//! Driver callbacks are registered on the default event loop and translated
//! into bus events. The loop must exist before any adapter is created
//! (taking `EspSystemEventLoop` creates it).

use super::{
    AssociationInfo, AuthMode, Bssid, EventBus, ProvisioningEvent, ProvisioningListener, Radio,
    RadioError, RadioEvent, Restarter, VisibleNetwork,
};
use crate::config::Credential;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::{self as sys, esp, EspError};
use log::{debug, info, warn};
use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Upper bound on scan records read per scan.
const MAX_SCAN_RECORDS: usize = 20;

/// Smart-config accepts both ESP-Touch and AirKiss (WeChat) senders.
const SMARTCONFIG_TYPE: sys::smartconfig_type_t = sys::smartconfig_type_t_SC_TYPE_ESPTOUCH_AIRKISS;

type EventHandler = unsafe extern "C" fn(*mut c_void, sys::esp_event_base_t, i32, *mut c_void);

/// Handler registered on the default event loop for one event base.
///
/// Owns the boxed bus handed to the C side and unregisters before freeing it.
struct Registration {
    base: sys::esp_event_base_t,
    handler: EventHandler,
    bus: *mut EventBus,
}

// The bus pointer is only dereferenced by the handler, and `EventBus` is
// `Send + Sync`.
unsafe impl Send for Registration {}
unsafe impl Sync for Registration {}

impl Registration {
    fn new(
        base: sys::esp_event_base_t,
        handler: EventHandler,
        bus: EventBus,
    ) -> Result<Self, EspError> {
        let bus = Box::into_raw(Box::new(bus));
        let registered = esp!(unsafe {
            sys::esp_event_handler_register(base, sys::ESP_EVENT_ANY_ID, Some(handler), bus.cast())
        });
        if let Err(e) = registered {
            drop(unsafe { Box::from_raw(bus) });
            return Err(e);
        }
        Ok(Self { base, handler, bus })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let unregistered = esp!(unsafe {
            sys::esp_event_handler_unregister(self.base, sys::ESP_EVENT_ANY_ID, Some(self.handler))
        });
        match unregistered {
            Ok(()) => drop(unsafe { Box::from_raw(self.bus) }),
            // Leak rather than free memory the handler may still use
            Err(e) => warn!("Failed to unregister event handler: {:?}", e),
        }
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn auth_mode(mode: sys::wifi_auth_mode_t) -> AuthMode {
    #[allow(non_upper_case_globals)]
    match mode {
        sys::wifi_auth_mode_t_WIFI_AUTH_OPEN => AuthMode::Open,
        sys::wifi_auth_mode_t_WIFI_AUTH_WEP => AuthMode::Wep,
        sys::wifi_auth_mode_t_WIFI_AUTH_WPA_PSK => AuthMode::WpaPsk,
        sys::wifi_auth_mode_t_WIFI_AUTH_WPA2_PSK => AuthMode::Wpa2Psk,
        sys::wifi_auth_mode_t_WIFI_AUTH_WPA_WPA2_PSK => AuthMode::WpaWpa2Psk,
        sys::wifi_auth_mode_t_WIFI_AUTH_WPA3_PSK => AuthMode::Wpa3Psk,
        sys::wifi_auth_mode_t_WIFI_AUTH_WPA2_WPA3_PSK => AuthMode::Wpa2Wpa3Psk,
        sys::wifi_auth_mode_t_WIFI_AUTH_WPA2_ENTERPRISE => AuthMode::Wpa2Enterprise,
        _ => AuthMode::Unknown,
    }
}

/// Read the records of a finished scan.
fn scan_results() -> Result<Vec<VisibleNetwork>, EspError> {
    let mut count: u16 = 0;
    esp!(unsafe { sys::esp_wifi_scan_get_ap_num(&mut count) })?;
    let mut count = count.min(MAX_SCAN_RECORDS as u16);

    let mut records: Vec<sys::wifi_ap_record_t> = vec![Default::default(); count as usize];
    esp!(unsafe { sys::esp_wifi_scan_get_ap_records(&mut count, records.as_mut_ptr()) })?;
    records.truncate(count as usize);

    Ok(records
        .iter()
        .map(|r| VisibleNetwork {
            ssid: c_string(&r.ssid),
            rssi: r.rssi,
            auth: auth_mode(r.authmode),
        })
        .collect())
}

unsafe extern "C" fn on_wifi_event(
    arg: *mut c_void,
    _base: sys::esp_event_base_t,
    id: i32,
    _data: *mut c_void,
) {
    let bus = &*(arg as *const EventBus);
    #[allow(non_upper_case_globals)]
    match id as u32 {
        sys::wifi_event_t_WIFI_EVENT_STA_START => bus.publish(RadioEvent::StationStarted),
        sys::wifi_event_t_WIFI_EVENT_SCAN_DONE => match scan_results() {
            Ok(networks) => bus.publish(RadioEvent::ScanComplete(networks)),
            Err(e) => {
                warn!("Failed to read scan results: {:?}", e);
                bus.publish(RadioEvent::ScanComplete(Vec::new()));
            }
        },
        sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => bus.publish(RadioEvent::Disconnected),
        _ => {}
    }
}

unsafe extern "C" fn on_ip_event(
    arg: *mut c_void,
    _base: sys::esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let bus = &*(arg as *const EventBus);
    if id as u32 == sys::ip_event_t_IP_EVENT_STA_GOT_IP && !data.is_null() {
        let event = &*(data as *const sys::ip_event_got_ip_t);
        let ip = Ipv4Addr::from(event.ip_info.ip.addr.to_le_bytes());
        bus.publish(RadioEvent::GotIp(ip));
    }
}

unsafe extern "C" fn on_smartconfig_event(
    arg: *mut c_void,
    _base: sys::esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let bus = &*(arg as *const EventBus);
    #[allow(non_upper_case_globals)]
    match id as u32 {
        sys::smartconfig_event_t_SC_EVENT_SCAN_DONE => {
            bus.publish(ProvisioningEvent::ScanStageDone)
        }
        sys::smartconfig_event_t_SC_EVENT_FOUND_CHANNEL => {
            bus.publish(ProvisioningEvent::ChannelFound)
        }
        sys::smartconfig_event_t_SC_EVENT_GOT_SSID_PSWD if !data.is_null() => {
            let event = &*(data as *const sys::smartconfig_event_got_ssid_pswd_t);
            let credential = Credential {
                ssid: c_string(&event.ssid),
                password: c_string(&event.password),
            };
            let bssid: Option<Bssid> = event.bssid_set.then_some(event.bssid);
            bus.publish(ProvisioningEvent::CredentialDecoded { credential, bssid });
        }
        sys::smartconfig_event_t_SC_EVENT_SEND_ACK_DONE => bus.publish(ProvisioningEvent::AckSent),
        _ => {}
    }
}

/// Station radio on the ESP32 WiFi driver.
///
/// Clones share the driver.
#[derive(Clone)]
pub struct EspRadio {
    wifi: Arc<Mutex<EspWifi<'static>>>,
    _events: Arc<[Registration; 2]>,
}

impl EspRadio {
    /// Take the modem and publish its events on `bus`.
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
        bus: &EventBus,
    ) -> Result<Self, EspError> {
        let wifi = EspWifi::new(modem, sysloop, nvs)?;
        let events = [
            Registration::new(sys::WIFI_EVENT, on_wifi_event, bus.clone())?,
            Registration::new(sys::IP_EVENT, on_ip_event, bus.clone())?,
        ];
        Ok(Self {
            wifi: Arc::new(Mutex::new(wifi)),
            _events: Arc::new(events),
        })
    }

    fn wifi(&self) -> MutexGuard<'_, EspWifi<'static>> {
        self.wifi
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Radio for EspRadio {
    fn start_station(&mut self) -> Result<(), RadioError> {
        let mut wifi = self.wifi();
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start()?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        self.wifi().stop()?;
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        esp!(unsafe { sys::esp_wifi_scan_start(ptr::null(), false) })?;
        Ok(())
    }

    fn set_config(
        &mut self,
        credential: &Credential,
        bssid: Option<Bssid>,
    ) -> Result<(), RadioError> {
        let auth_method = if credential.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let config = Configuration::Client(ClientConfiguration {
            ssid: credential
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::command("set_config", "SSID too long"))?,
            password: credential
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::command("set_config", "password too long"))?,
            bssid,
            auth_method,
            ..Default::default()
        });
        self.wifi().set_configuration(&config)?;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), RadioError> {
        self.wifi().connect()?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.wifi().disconnect()?;
        Ok(())
    }

    fn set_power_save(&mut self, enabled: bool) -> Result<(), RadioError> {
        let mode = if enabled {
            sys::wifi_ps_type_t_WIFI_PS_MIN_MODEM
        } else {
            sys::wifi_ps_type_t_WIFI_PS_NONE
        };
        esp!(unsafe { sys::esp_wifi_set_ps(mode) })?;
        Ok(())
    }

    fn association_info(&self) -> Result<AssociationInfo, RadioError> {
        let mut record = sys::wifi_ap_record_t::default();
        esp!(unsafe { sys::esp_wifi_sta_get_ap_info(&mut record) })
            .map_err(|_| RadioError::NotAssociated)?;
        Ok(AssociationInfo {
            rssi: record.rssi,
            channel: record.primary,
        })
    }
}

/// ESP-Touch / AirKiss smart-config receiver.
pub struct SmartConfigListener {
    _events: Registration,
    running: bool,
}

impl SmartConfigListener {
    /// Publish smart-config events on `bus`.
    pub fn new(bus: &EventBus) -> Result<Self, EspError> {
        Ok(Self {
            _events: Registration::new(sys::SC_EVENT, on_smartconfig_event, bus.clone())?,
            running: false,
        })
    }
}

impl ProvisioningListener for SmartConfigListener {
    fn start(&mut self) -> Result<(), RadioError> {
        esp!(unsafe { sys::esp_smartconfig_set_type(SMARTCONFIG_TYPE) })?;
        let config = sys::smartconfig_start_config_t::default();
        esp!(unsafe { sys::esp_smartconfig_start(&config) })?;
        self.running = true;
        info!("Smart-config started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        if self.running {
            esp!(unsafe { sys::esp_smartconfig_stop() })?;
            self.running = false;
            debug!("Smart-config stopped");
        }
        Ok(())
    }
}

impl Drop for SmartConfigListener {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop smart-config: {}", e);
        }
    }
}

/// Restarts the chip after the delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct EspRestarter;

impl Restarter for EspRestarter {
    fn schedule_restart(&self, delay: Duration) {
        warn!("Restarting in {:?}", delay);
        let spawned = std::thread::Builder::new()
            .name("restart".into())
            .stack_size(4096)
            .spawn(move || {
                std::thread::sleep(delay);
                info!("Restarting now");
                esp_idf_hal::reset::restart();
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn restart thread ({}), restarting now", e);
            esp_idf_hal::reset::restart();
        }
    }
}
