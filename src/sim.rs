//! Simulated radio and provisioning listener.
//!
//! [`SimRadio`] behaves like the station driver: every command is recorded,
//! and its result is published on the [`EventBus`] as the driver's event
//! callback would. Access points are configured up front and can be changed
//! while a flow runs.
//!
//! # Example
//!
//! ```
//! use wifi_station_esp32::sim::{SimNetwork, SimRadio};
//! use wifi_station_esp32::wifi::EventBus;
//!
//! let bus = EventBus::new();
//! let radio = SimRadio::new(bus.clone());
//! radio.add_network(SimNetwork::new("Home", "password123"));
//! ```

use crate::config::Credential;
use crate::wifi::{
    AssociationInfo, AuthMode, Bssid, EventBus, ProvisioningEvent, ProvisioningListener, Radio,
    RadioError, RadioEvent, Restarter, StatusSink, VisibleNetwork,
};
use log::{debug, info};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A simulated access point.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    pub ssid: String,
    pub password: String,
    pub rssi: i8,
    pub channel: u8,
}

impl SimNetwork {
    /// Access point with a typical signal on channel 6.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            rssi: -55,
            channel: 6,
        }
    }

    /// Same access point with another signal strength and channel.
    pub fn with_signal(mut self, rssi: i8, channel: u8) -> Self {
        self.rssi = rssi;
        self.channel = channel;
        self
    }

    fn auth(&self) -> AuthMode {
        if self.password.is_empty() {
            AuthMode::Open
        } else {
            AuthMode::Wpa2Psk
        }
    }
}

/// A command received by [`SimRadio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartStation,
    Stop,
    StartScan,
    SetConfig { ssid: String, bssid: Option<Bssid> },
    Connect,
    Disconnect,
    SetPowerSave(bool),
}

#[derive(Debug, Default)]
struct SimState {
    networks: Vec<SimNetwork>,
    calls: Vec<RadioCall>,
    started: bool,
    config: Option<Credential>,
    associated: Option<String>,
    fail_connects: usize,
    empty_scans: usize,
    leases: u8,
}

/// Simulated station radio.
///
/// Clones share state, so a test can keep a handle while a state machine
/// owns another.
#[derive(Debug, Clone)]
pub struct SimRadio {
    bus: EventBus,
    state: Arc<Mutex<SimState>>,
}

impl SimRadio {
    /// Create a radio with no access points in range.
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Put an access point in range.
    pub fn add_network(&self, network: SimNetwork) {
        lock(&self.state).networks.push(network);
    }

    /// Take an access point out of range.
    pub fn remove_network(&self, ssid: &str) {
        lock(&self.state).networks.retain(|n| n.ssid != ssid);
    }

    /// Make the next `count` connects fail regardless of credentials.
    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.state).fail_connects = count;
    }

    /// Make the next `count` scans find nothing.
    pub fn empty_next_scans(&self, count: usize) {
        lock(&self.state).empty_scans = count;
    }

    /// Drop the current association as if the access point went away.
    pub fn drop_link(&self) {
        let dropped = lock(&self.state).associated.take();
        if let Some(ssid) = dropped {
            info!("[sim] Link to {} lost", ssid);
            self.bus.publish(RadioEvent::Disconnected);
        }
    }

    /// Every command received so far.
    pub fn calls(&self) -> Vec<RadioCall> {
        lock(&self.state).calls.clone()
    }

    /// Number of received commands equal to `call`.
    pub fn count(&self, call: &RadioCall) -> usize {
        lock(&self.state).calls.iter().filter(|c| *c == call).count()
    }

    /// SSID of the current association.
    pub fn associated(&self) -> Option<String> {
        lock(&self.state).associated.clone()
    }

    fn record(&self, call: RadioCall) -> MutexGuard<'_, SimState> {
        let mut state = lock(&self.state);
        debug!("[sim] {:?}", call);
        state.calls.push(call);
        state
    }
}

impl Radio for SimRadio {
    fn start_station(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioCall::StartStation);
        if !state.started {
            state.started = true;
            self.bus.publish(RadioEvent::StationStarted);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioCall::Stop);
        state.started = false;
        state.associated = None;
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioCall::StartScan);
        if !state.started {
            return Err(RadioError::command("scan", "station not started"));
        }
        let visible = if state.empty_scans > 0 {
            state.empty_scans -= 1;
            Vec::new()
        } else {
            state
                .networks
                .iter()
                .map(|n| VisibleNetwork {
                    ssid: n.ssid.clone(),
                    rssi: n.rssi,
                    auth: n.auth(),
                })
                .collect()
        };
        self.bus.publish(RadioEvent::ScanComplete(visible));
        Ok(())
    }

    fn set_config(
        &mut self,
        credential: &Credential,
        bssid: Option<Bssid>,
    ) -> Result<(), RadioError> {
        let mut state = self.record(RadioCall::SetConfig {
            ssid: credential.ssid.clone(),
            bssid,
        });
        state.config = Some(credential.clone());
        Ok(())
    }

    fn connect(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioCall::Connect);
        if !state.started {
            return Err(RadioError::command("connect", "station not started"));
        }
        let Some(config) = state.config.clone() else {
            return Err(RadioError::command("connect", "no configuration"));
        };

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            self.bus.publish(RadioEvent::Disconnected);
            return Ok(());
        }

        let reachable = state
            .networks
            .iter()
            .any(|n| n.ssid == config.ssid && n.password == config.password);
        if reachable {
            state.leases = state.leases.wrapping_add(1);
            let ip = Ipv4Addr::new(192, 168, 1, 100u8.wrapping_add(state.leases));
            state.associated = Some(config.ssid.clone());
            self.bus.publish(RadioEvent::GotIp(ip));
        } else {
            self.bus.publish(RadioEvent::Disconnected);
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioCall::Disconnect);
        if state.associated.take().is_some() {
            self.bus.publish(RadioEvent::Disconnected);
        }
        Ok(())
    }

    fn set_power_save(&mut self, enabled: bool) -> Result<(), RadioError> {
        drop(self.record(RadioCall::SetPowerSave(enabled)));
        Ok(())
    }

    fn association_info(&self) -> Result<AssociationInfo, RadioError> {
        let state = lock(&self.state);
        let ssid = state.associated.as_ref().ok_or(RadioError::NotAssociated)?;
        state
            .networks
            .iter()
            .find(|n| &n.ssid == ssid)
            .map(|n| AssociationInfo {
                rssi: n.rssi,
                channel: n.channel,
            })
            .ok_or(RadioError::NotAssociated)
    }
}

#[derive(Debug, Default)]
struct ProvisionerState {
    running: bool,
    starts: usize,
    stops: usize,
    queued: Option<(Credential, Option<Bssid>)>,
}

/// Simulated out-of-band provisioning listener.
///
/// A queued credential is delivered as soon as the listener starts, preceded
/// by the channel sweep events a real phone session produces.
#[derive(Debug, Clone)]
pub struct SimProvisioner {
    bus: EventBus,
    state: Arc<Mutex<ProvisionerState>>,
}

impl SimProvisioner {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(ProvisionerState::default())),
        }
    }

    /// Deliver `credential` on the next start, or now if already running.
    pub fn queue(&self, credential: Credential, bssid: Option<Bssid>) {
        let running = {
            let mut state = lock(&self.state);
            state.queued = Some((credential, bssid));
            state.running
        };
        if running {
            self.deliver();
        }
    }

    /// Report that the phone was acknowledged.
    pub fn acknowledge(&self) {
        self.bus.publish(ProvisioningEvent::AckSent);
    }

    /// Check whether the listener is running.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Number of `(start, stop)` calls so far.
    pub fn transitions(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.starts, state.stops)
    }

    fn deliver(&self) {
        let queued = lock(&self.state).queued.take();
        if let Some((credential, bssid)) = queued {
            self.bus.publish(ProvisioningEvent::ScanStageDone);
            self.bus.publish(ProvisioningEvent::ChannelFound);
            self.bus
                .publish(ProvisioningEvent::CredentialDecoded { credential, bssid });
        }
    }
}

impl ProvisioningListener for SimProvisioner {
    fn start(&mut self) -> Result<(), RadioError> {
        {
            let mut state = lock(&self.state);
            if state.running {
                return Err(RadioError::command("provisioning start", "already running"));
            }
            state.running = true;
            state.starts += 1;
        }
        self.deliver();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        let mut state = lock(&self.state);
        state.running = false;
        state.stops += 1;
        Ok(())
    }
}

/// [`Restarter`] that records requests instead of restarting.
#[derive(Debug, Default)]
pub struct RecordingRestarter {
    requests: Mutex<Vec<Duration>>,
}

impl RecordingRestarter {
    /// Delays of every restart requested so far.
    pub fn requests(&self) -> Vec<Duration> {
        lock(&self.requests).clone()
    }
}

impl Restarter for RecordingRestarter {
    fn schedule_restart(&self, delay: Duration) {
        info!("[sim] Restart requested in {:?}", delay);
        lock(&self.requests).push(delay);
    }
}

/// [`StatusSink`] that records every message.
#[derive(Debug, Default)]
pub struct RecordingStatus {
    messages: Mutex<Vec<String>>,
}

impl RecordingStatus {
    /// Messages shown so far.
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

impl StatusSink for RecordingStatus {
    fn show(&self, text: &str) {
        lock(&self.messages).push(text.to_string());
    }
}
