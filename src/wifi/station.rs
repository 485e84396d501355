//! Direct connection to a stored network.
//!
//! ```text
//! Idle ──start──▶ Starting ──StationStarted──▶ Scanning ──match──▶ Connecting ──GotIp──▶ Connected
//!                                               │    ▲                │    ▲                  │
//!                                        no match│    │rescan  Disconnected│    │reconnect   Disconnected
//!                                               ▼    │                ▼    │                  │
//!                                               └────┘                └────┘◀─────────────────┘
//!                     scan attempts exhausted / reconnects exhausted ──▶ Failed
//! ```
//!
//! Without stored credentials `start()` resolves at once with
//! [`StationOutcome::NoConfiguration`] and no radio command is issued.

use super::dispatch::{self, spawn_dispatcher, wait_outcome, Dispatcher, Transitions, Verdict};
use super::{Event, EventBus, Radio, RadioEvent, VisibleNetwork, WifiError};
use crate::config::{Credential, StationConfig, WifiStatus};
use crate::credentials::{self, CredentialSlot, ScoreUpdate, SharedStore};
use crate::storage::KvStore;
use log::{debug, error, info, warn};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// First slot, in slot order, whose SSID is among `visible`.
///
/// Stops at the first match; later slots are not considered.
pub fn match_visible(slots: &[CredentialSlot], visible: &[VisibleNetwork]) -> Option<usize> {
    slots.iter().position(|slot| {
        slot.ssid()
            .map_or(false, |ssid| visible.iter().any(|n| n.ssid == ssid))
    })
}

/// Where the station flow is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationState {
    /// Not started, or nothing to connect to.
    Idle,
    /// Waiting for station mode to come up.
    Starting,
    /// Waiting for scan results.
    Scanning,
    /// Waiting for an address from the chosen network.
    Connecting,
    Connected,
    Failed,
}

/// Why the station flow gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No stored network showed up within the scan budget.
    NoVisibleMatch,
    /// The chosen network kept refusing or dropping the connection.
    ConnectFailed { slot: usize, ssid: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoVisibleMatch => write!(f, "no known network in range"),
            Self::ConnectFailed { ssid, .. } => write!(f, "could not connect to {}", ssid),
        }
    }
}

/// How a `start()` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationOutcome {
    Connected {
        slot: usize,
        ssid: String,
        ip: Ipv4Addr,
    },
    /// The credential table is empty; provision first.
    NoConfiguration,
    Exhausted(FailureReason),
}

#[derive(Debug, Clone)]
struct ActiveSlot {
    index: usize,
    ssid: String,
}

/// Transition function of the station flow.
pub struct StationMachine<R: Radio, S: KvStore> {
    radio: R,
    store: SharedStore<S>,
    config: StationConfig,
    state: StationState,
    radio_started: bool,
    scan_attempts: u8,
    reconnects: u8,
    active: Option<ActiveSlot>,
    ip: Option<Ipv4Addr>,
    success_reported: bool,
    failure: Option<String>,
}

impl<R: Radio, S: KvStore> StationMachine<R, S> {
    pub fn new(radio: R, store: SharedStore<S>, config: StationConfig) -> Self {
        Self {
            radio,
            store,
            config,
            state: StationState::Idle,
            radio_started: false,
            scan_attempts: 0,
            reconnects: 0,
            active: None,
            ip: None,
            success_reported: false,
            failure: None,
        }
    }

    /// Start a new episode. Counters are reset.
    ///
    /// Returns a verdict if the episode ends immediately.
    pub fn begin(&mut self) -> Option<Verdict<StationOutcome>> {
        self.scan_attempts = 0;
        self.reconnects = 0;
        self.active = None;
        self.ip = None;
        self.success_reported = false;
        self.failure = None;

        if let Err(e) = self.config.validate() {
            error!("Station flow not started: {}", e);
            return Some(Err(e.into()));
        }
        if !credentials::lock(&self.store).has_known_networks() {
            info!("No stored networks");
            self.state = StationState::Idle;
            return Some(Ok(StationOutcome::NoConfiguration));
        }

        if self.radio_started {
            return self.scan();
        }
        info!("Starting station");
        self.state = StationState::Starting;
        if let Err(e) = self.radio.start_station() {
            return self.abort(e.into());
        }
        None
    }

    fn scan(&mut self) -> Option<Verdict<StationOutcome>> {
        self.state = StationState::Scanning;
        debug!("Scanning (attempt {})", self.scan_attempts + 1);
        match self.radio.start_scan() {
            Ok(()) => None,
            Err(e) => self.abort(e.into()),
        }
    }

    fn on_scan_complete(&mut self, visible: &[VisibleNetwork]) -> Option<Verdict<StationOutcome>> {
        debug!("Scan found {} network(s)", visible.len());
        let slots = credentials::lock(&self.store).slots();

        let Some(index) = match_visible(&slots, visible) else {
            self.scan_attempts += 1;
            if self.scan_attempts >= self.config.max_scan_attempts {
                warn!(
                    "No known network after {} scan(s), giving up",
                    self.scan_attempts
                );
                return self.fail(FailureReason::NoVisibleMatch);
            }
            debug!("No known network in range, rescanning");
            return self.scan();
        };

        let Some(credential) = slots[index].credential.as_ref() else {
            return self.scan();
        };
        self.connect_to(index, credential)
    }

    fn connect_to(
        &mut self,
        index: usize,
        credential: &Credential,
    ) -> Option<Verdict<StationOutcome>> {
        info!("Connecting to {} (slot {})", credential.ssid, index);
        self.active = Some(ActiveSlot {
            index,
            ssid: credential.ssid.clone(),
        });
        self.reconnects = 0;
        self.state = StationState::Connecting;

        let issued = self
            .radio
            .set_config(credential, None)
            .and_then(|()| self.radio.connect());
        match issued {
            Ok(()) => None,
            Err(e) => self.abort(e.into()),
        }
    }

    fn on_disconnected(&mut self) -> Option<Verdict<StationOutcome>> {
        let active = self.active.clone()?;

        if self.state == StationState::Connected {
            warn!("Lost connection to {}", active.ssid);
            self.state = StationState::Connecting;
            self.ip = None;
        }

        if self.reconnects < self.config.max_reconnects {
            self.reconnects += 1;
            info!(
                "Reconnecting to {} ({}/{})",
                active.ssid, self.reconnects, self.config.max_reconnects
            );
            return match self.radio.connect() {
                Ok(()) => None,
                Err(e) => self.abort(e.into()),
            };
        }

        warn!(
            "Giving up on {} after {} reconnect(s)",
            active.ssid, self.reconnects
        );
        if let Err(e) = self.report(active.index, false) {
            return self.abort(e);
        }
        self.fail(FailureReason::ConnectFailed {
            slot: active.index,
            ssid: active.ssid,
        })
    }

    fn on_got_ip(&mut self, ip: Ipv4Addr) -> Option<Verdict<StationOutcome>> {
        let active = self.active.clone()?;
        info!("Connected to {}, IP {}", active.ssid, ip);
        self.state = StationState::Connected;
        self.ip = Some(ip);
        self.reconnects = 0;

        if !self.success_reported {
            self.success_reported = true;
            if let Err(e) = self.report(active.index, true) {
                error!("Failed to record success for slot {}: {}", active.index, e);
                return Some(Err(e));
            }
        }

        Some(Ok(StationOutcome::Connected {
            slot: active.index,
            ssid: active.ssid,
            ip,
        }))
    }

    fn report(&self, index: usize, success: bool) -> Result<(), WifiError> {
        match credentials::lock(&self.store).report_outcome(index, success)? {
            ScoreUpdate::Scored(score) => debug!("Slot {} score now {}", index, score),
            ScoreUpdate::Evicted => info!("Slot {} evicted", index),
        }
        Ok(())
    }

    fn fail(&mut self, reason: FailureReason) -> Option<Verdict<StationOutcome>> {
        self.enter_failed(reason.to_string());
        Some(Ok(StationOutcome::Exhausted(reason)))
    }

    fn abort(&mut self, e: WifiError) -> Option<Verdict<StationOutcome>> {
        error!("Station flow aborted: {}", e);
        self.enter_failed(e.to_string());
        Some(Err(e))
    }

    fn enter_failed(&mut self, reason: String) {
        self.state = StationState::Failed;
        self.ip = None;
        self.failure = Some(reason);
        if let Err(e) = self.radio.stop() {
            warn!("Failed to stop radio: {}", e);
        }
        self.radio_started = false;
    }

    pub fn state(&self) -> StationState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == StationState::Connected
    }

    pub fn ip_addr(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    /// SSID of the network being joined or joined.
    pub fn active_ssid(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.ssid.as_str())
    }

    pub fn status(&self) -> WifiStatus {
        match self.state {
            StationState::Idle => WifiStatus::Unconfigured,
            StationState::Starting | StationState::Scanning | StationState::Connecting => {
                WifiStatus::Connecting
            }
            StationState::Connected => WifiStatus::Connected {
                ip: self.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            },
            StationState::Failed => WifiStatus::Failed {
                reason: self.failure.clone().unwrap_or_default(),
            },
        }
    }

    /// Signal strength in dBm. Only valid while connected.
    pub fn signal_strength(&self) -> Result<i8, WifiError> {
        if !self.is_connected() {
            return Err(WifiError::NotConnected);
        }
        Ok(self.radio.association_info()?.rssi)
    }

    /// Primary channel. Only valid while connected.
    pub fn channel(&self) -> Result<u8, WifiError> {
        if !self.is_connected() {
            return Err(WifiError::NotConnected);
        }
        Ok(self.radio.association_info()?.channel)
    }

    pub fn set_power_save(&mut self, enabled: bool) -> Result<(), WifiError> {
        self.radio.set_power_save(enabled)?;
        debug!("Power save {}", if enabled { "on" } else { "off" });
        Ok(())
    }
}

impl<R, S> Transitions for StationMachine<R, S>
where
    R: Radio + 'static,
    S: KvStore + 'static,
{
    type Outcome = StationOutcome;

    const NAME: &'static str = "Station";

    fn handle(&mut self, event: &Event) -> Option<Verdict<StationOutcome>> {
        let Event::Radio(event) = event else {
            return None;
        };
        match (self.state, event) {
            (StationState::Starting, RadioEvent::StationStarted) => {
                self.radio_started = true;
                self.scan()
            }
            (_, RadioEvent::StationStarted) => {
                self.radio_started = true;
                None
            }
            (StationState::Scanning, RadioEvent::ScanComplete(visible)) => {
                self.on_scan_complete(visible)
            }
            (StationState::Connecting | StationState::Connected, RadioEvent::Disconnected) => {
                self.on_disconnected()
            }
            (StationState::Connecting, RadioEvent::GotIp(ip)) => self.on_got_ip(*ip),
            (state, event) => {
                debug!("Station ignoring {:?} in {:?}", event, state);
                None
            }
        }
    }
}

/// Connects to the best stored network that is in range.
///
/// Owns a [`StationMachine`] and the dispatcher task feeding it. Dropping
/// the manager stops the dispatcher.
pub struct ConnectionManager<R, S>
where
    R: Radio + 'static,
    S: KvStore + 'static,
{
    machine: Arc<Mutex<StationMachine<R, S>>>,
    bus: EventBus,
    cancel: CancellationToken,
    dispatcher: Option<Dispatcher>,
}

impl<R, S> ConnectionManager<R, S>
where
    R: Radio + 'static,
    S: KvStore + 'static,
{
    pub fn new(radio: R, store: SharedStore<S>, bus: EventBus, config: StationConfig) -> Self {
        Self {
            machine: Arc::new(Mutex::new(StationMachine::new(radio, store, config))),
            bus,
            cancel: CancellationToken::new(),
            dispatcher: None,
        }
    }

    /// Token that cancels a pending [`start`](Self::start) and stops the
    /// dispatcher. Once cancelled, the manager stays shut down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the flow until it connects or gives up.
    ///
    /// Resolves once per call; after a successful connect the dispatcher keeps
    /// running and handles link loss in the background.
    pub async fn start(&mut self) -> Result<StationOutcome, WifiError> {
        // The previous episode's task must be gone before begin() runs
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.stop().await;
        }
        if self.cancel.is_cancelled() {
            return Err(WifiError::Cancelled);
        }

        // Subscribe FIRST so no event triggered by begin() is missed
        let events = self.bus.subscribe();
        let (tx, rx) = oneshot::channel();

        if let Some(verdict) = dispatch::lock(&self.machine).begin() {
            return verdict;
        }

        self.dispatcher = Some(spawn_dispatcher(
            Arc::clone(&self.machine),
            events,
            tx,
            self.cancel.child_token(),
        ));
        wait_outcome(rx, &self.cancel).await
    }

    pub fn state(&self) -> StationState {
        dispatch::lock(&self.machine).state()
    }

    pub fn is_connected(&self) -> bool {
        dispatch::lock(&self.machine).is_connected()
    }

    pub fn ip_addr(&self) -> Option<Ipv4Addr> {
        dispatch::lock(&self.machine).ip_addr()
    }

    pub fn active_ssid(&self) -> Option<String> {
        dispatch::lock(&self.machine).active_ssid().map(str::to_string)
    }

    pub fn status(&self) -> WifiStatus {
        dispatch::lock(&self.machine).status()
    }

    /// Signal strength in dBm of the current connection.
    pub fn signal_strength(&self) -> Result<i8, WifiError> {
        dispatch::lock(&self.machine).signal_strength()
    }

    /// Channel of the current connection.
    pub fn channel(&self) -> Result<u8, WifiError> {
        dispatch::lock(&self.machine).channel()
    }

    pub fn set_power_save(&self, enabled: bool) -> Result<(), WifiError> {
        dispatch::lock(&self.machine).set_power_save(enabled)
    }
}

impl<R, S> Drop for ConnectionManager<R, S>
where
    R: Radio + 'static,
    S: KvStore + 'static,
{
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialStore;
    use crate::sim::{RadioCall, SimNetwork, SimRadio};
    use crate::storage::MemoryStore;
    use crate::wifi::dispatch::pump;
    use crate::wifi::{AuthMode, ProvisioningEvent};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn init_logging() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .is_test(true)
            .try_init()
            .ok();
    }

    fn store_with(ssids: &[&str]) -> SharedStore<MemoryStore> {
        let mut store = CredentialStore::open(MemoryStore::new());
        store.load().unwrap();
        for (index, ssid) in ssids.iter().enumerate() {
            store
                .write(index, &Credential::new(*ssid, "password123").unwrap())
                .unwrap();
        }
        store.shared()
    }

    fn score(store: &SharedStore<MemoryStore>, index: usize) -> Option<i32> {
        credentials::lock(store)
            .slot(index)
            .filter(|s| s.is_occupied())
            .map(|s| s.score)
    }

    fn visible(ssid: &str) -> VisibleNetwork {
        VisibleNetwork {
            ssid: ssid.to_string(),
            rssi: -60,
            auth: AuthMode::Wpa2Psk,
        }
    }

    struct Harness {
        radio: SimRadio,
        store: SharedStore<MemoryStore>,
        machine: StationMachine<SimRadio, MemoryStore>,
        events: broadcast::Receiver<Event>,
    }

    impl Harness {
        fn new(ssids: &[&str]) -> Self {
            Self::with_config(ssids, StationConfig::default())
        }

        fn with_config(ssids: &[&str], config: StationConfig) -> Self {
            init_logging();
            let bus = EventBus::new();
            let events = bus.subscribe();
            let radio = SimRadio::new(bus);
            let store = store_with(ssids);
            let machine = StationMachine::new(radio.clone(), Arc::clone(&store), config);
            Self {
                radio,
                store,
                machine,
                events,
            }
        }

        fn start(&mut self) -> Vec<Verdict<StationOutcome>> {
            let mut verdicts: Vec<_> = self.machine.begin().into_iter().collect();
            verdicts.extend(self.pump());
            verdicts
        }

        fn pump(&mut self) -> Vec<Verdict<StationOutcome>> {
            pump(&mut self.machine, &mut self.events)
        }
    }

    #[test]
    fn test_match_first_slot_in_order() {
        let store = store_with(&["Cafe", "Office", "Home"]);
        let slots = credentials::lock(&store).slots();
        let networks = [visible("Home"), visible("Office")];
        assert_eq!(match_visible(&slots, &networks), Some(1));
    }

    #[test]
    fn test_match_skips_free_slots() {
        let mut slots = credentials::lock(&store_with(&["Cafe", "Office", "Home"])).slots();
        slots[0] = CredentialSlot::default();
        assert_eq!(match_visible(&slots, &[visible("Home"), visible("Cafe")]), Some(2));
    }

    #[test]
    fn test_match_none() {
        let slots = credentials::lock(&store_with(&["Cafe"])).slots();
        assert_eq!(match_visible(&slots, &[visible("Home")]), None);
        assert_eq!(match_visible(&slots, &[]), None);
    }

    #[test]
    fn test_empty_store_issues_no_radio_calls() {
        let mut h = Harness::new(&[]);
        let verdicts = h.start();
        assert!(matches!(
            verdicts.as_slice(),
            [Ok(StationOutcome::NoConfiguration)]
        ));
        assert!(h.radio.calls().is_empty());
        assert_eq!(h.machine.status(), WifiStatus::Unconfigured);
    }

    #[test]
    fn test_connects_to_first_visible_slot() {
        let mut h = Harness::new(&["Cafe", "Office", "Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        h.radio.add_network(SimNetwork::new("Office", "password123"));

        let verdicts = h.start();
        match verdicts.as_slice() {
            [Ok(StationOutcome::Connected { slot, ssid, .. })] => {
                assert_eq!(*slot, 1);
                assert_eq!(ssid, "Office");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            h.radio.calls(),
            vec![
                RadioCall::StartStation,
                RadioCall::StartScan,
                RadioCall::SetConfig {
                    ssid: "Office".to_string(),
                    bssid: None
                },
                RadioCall::Connect,
            ]
        );
        assert_eq!(score(&h.store, 1), Some(1));
        assert_eq!(score(&h.store, 2), Some(0));
        assert!(h.machine.is_connected());
        assert!(matches!(h.machine.status(), WifiStatus::Connected { .. }));
    }

    #[test]
    fn test_gives_up_after_three_scans() {
        let mut h = Harness::new(&["Cafe"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));

        let verdicts = h.start();
        assert!(matches!(
            verdicts.as_slice(),
            [Ok(StationOutcome::Exhausted(FailureReason::NoVisibleMatch))]
        ));
        assert_eq!(h.radio.count(&RadioCall::StartScan), 3);
        assert_eq!(h.radio.count(&RadioCall::Connect), 0);
        assert_eq!(h.radio.count(&RadioCall::Stop), 1);
        assert_eq!(h.machine.state(), StationState::Failed);
        // Not scored: nothing was attempted
        assert_eq!(score(&h.store, 0), Some(0));
    }

    #[test]
    fn test_empty_scans_count_toward_budget() {
        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        h.radio.empty_next_scans(2);

        let verdicts = h.start();
        assert!(matches!(
            verdicts.as_slice(),
            [Ok(StationOutcome::Connected { slot: 0, .. })]
        ));
        assert_eq!(h.radio.count(&RadioCall::StartScan), 3);

        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        h.radio.empty_next_scans(3);
        assert!(matches!(
            h.start().as_slice(),
            [Ok(StationOutcome::Exhausted(FailureReason::NoVisibleMatch))]
        ));
    }

    #[test]
    fn test_reconnect_bound_then_failure_reported() {
        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        h.radio.fail_next_connects(usize::MAX);

        let verdicts = h.start();
        match verdicts.as_slice() {
            [Ok(StationOutcome::Exhausted(FailureReason::ConnectFailed { slot, ssid }))] => {
                assert_eq!(*slot, 0);
                assert_eq!(ssid, "Home");
            }
            other => panic!("unexpected {:?}", other),
        }
        // Initial connect plus five reconnects
        assert_eq!(h.radio.count(&RadioCall::Connect), 6);
        assert_eq!(score(&h.store, 0), Some(-1));
        assert!(matches!(h.machine.status(), WifiStatus::Failed { .. }));
    }

    #[test]
    fn test_transient_failures_recover() {
        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        h.radio.fail_next_connects(5);

        let verdicts = h.start();
        assert!(matches!(
            verdicts.as_slice(),
            [Ok(StationOutcome::Connected { .. })]
        ));
        assert_eq!(h.radio.count(&RadioCall::Connect), 6);
        assert_eq!(score(&h.store, 0), Some(1));
    }

    #[test]
    fn test_repeated_failures_evict_slot() {
        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "wrong-password"));

        for expected in [-1, -2, -3] {
            h.start();
            assert_eq!(score(&h.store, 0), Some(expected));
        }
        h.start();
        assert_eq!(score(&h.store, 0), None);

        // Nothing left to try
        assert!(matches!(
            h.start().as_slice(),
            [Ok(StationOutcome::NoConfiguration)]
        ));
    }

    #[test]
    fn test_counters_reset_between_starts() {
        let mut h = Harness::new(&["Home"]);
        h.start();
        assert_eq!(h.radio.count(&RadioCall::StartScan), 3);

        h.radio.add_network(SimNetwork::new("Home", "password123"));
        assert!(matches!(
            h.start().as_slice(),
            [Ok(StationOutcome::Connected { .. })]
        ));
        // The station was stopped on failure and is started again
        assert_eq!(h.radio.count(&RadioCall::StartStation), 2);
        assert_eq!(h.radio.count(&RadioCall::StartScan), 4);
    }

    #[test]
    fn test_link_loss_reconnects_without_rescoring() {
        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        h.start();
        assert_eq!(score(&h.store, 0), Some(1));

        h.radio.drop_link();
        let verdicts = h.pump();
        assert!(matches!(
            verdicts.as_slice(),
            [Ok(StationOutcome::Connected { .. })]
        ));
        assert_eq!(score(&h.store, 0), Some(1));
        assert!(h.machine.is_connected());
    }

    #[test]
    fn test_link_loss_exhaustion_reports_failure() {
        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        h.start();

        h.radio.remove_network("Home");
        h.radio.drop_link();
        let verdicts = h.pump();
        assert!(matches!(
            verdicts.as_slice(),
            [Ok(StationOutcome::Exhausted(FailureReason::ConnectFailed { .. }))]
        ));
        assert_eq!(score(&h.store, 0), Some(-1));
        assert!(!h.machine.is_connected());
        assert_eq!(h.machine.ip_addr(), None);
    }

    #[test]
    fn test_reconnect_counter_resets_on_connected() {
        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        h.radio.fail_next_connects(4);
        h.start();
        assert!(h.machine.is_connected());

        // The drop plus four failed reconnects only fit a fresh budget
        h.radio.fail_next_connects(4);
        h.radio.drop_link();
        assert!(matches!(
            h.pump().as_slice(),
            [Ok(StationOutcome::Connected { .. })]
        ));
    }

    #[test]
    fn test_association_info_requires_connection() {
        let mut h = Harness::new(&["Home"]);
        h.radio
            .add_network(SimNetwork::new("Home", "password123").with_signal(-48, 1));
        assert!(matches!(
            h.machine.signal_strength(),
            Err(WifiError::NotConnected)
        ));

        h.start();
        assert_eq!(h.machine.signal_strength().unwrap(), -48);
        assert_eq!(h.machine.channel().unwrap(), 1);

        h.machine.set_power_save(true).unwrap();
        assert_eq!(h.radio.count(&RadioCall::SetPowerSave(true)), 1);
    }

    #[test]
    fn test_storage_failure_on_success_is_surfaced() {
        let mut h = Harness::new(&["Home"]);
        h.radio.add_network(SimNetwork::new("Home", "password123"));
        credentials::lock(&h.store).storage_mut().set_fail_writes(true);

        let verdicts = h.start();
        assert!(matches!(verdicts.as_slice(), [Err(WifiError::Storage(_))]));
        // The link itself is up
        assert!(h.machine.is_connected());
    }

    #[test]
    fn test_ignores_provisioning_events() {
        let mut h = Harness::new(&["Home"]);
        assert!(h
            .machine
            .handle(&Event::Provisioning(ProvisioningEvent::AckSent))
            .is_none());
        assert_eq!(h.machine.state(), StationState::Idle);
    }

    #[test]
    fn test_invalid_config_refuses_to_start() {
        let mut h = Harness::with_config(
            &["Home"],
            StationConfig {
                max_reconnects: 0,
                ..Default::default()
            },
        );
        let verdicts = h.start();
        assert_eq!(verdicts.len(), 1);
        assert!(matches!(verdicts[0], Err(WifiError::InvalidConfig(_))));
        assert!(h.radio.calls().is_empty());
        assert_eq!(h.machine.state(), StationState::Idle);
    }

    #[tokio::test]
    async fn test_manager_empty_store() {
        init_logging();
        let bus = EventBus::new();
        let radio = SimRadio::new(bus.clone());
        let mut manager = ConnectionManager::new(
            radio.clone(),
            store_with(&[]),
            bus,
            StationConfig::default(),
        );

        let outcome = manager.start().await.unwrap();
        assert_eq!(outcome, StationOutcome::NoConfiguration);
        assert!(radio.calls().is_empty());
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_manager_connects_and_scores() {
        init_logging();
        let bus = EventBus::new();
        let radio = SimRadio::new(bus.clone());
        radio.add_network(SimNetwork::new("Home", "password123").with_signal(-42, 11));
        let store = store_with(&["Home"]);
        let mut manager = ConnectionManager::new(
            radio.clone(),
            Arc::clone(&store),
            bus,
            StationConfig::default(),
        );

        let outcome = manager.start().await.unwrap();
        assert!(matches!(outcome, StationOutcome::Connected { slot: 0, .. }));
        assert!(manager.is_connected());
        assert_eq!(manager.active_ssid().as_deref(), Some("Home"));
        assert_eq!(manager.signal_strength().unwrap(), -42);
        assert_eq!(manager.channel().unwrap(), 11);
        assert_eq!(score(&store, 0), Some(1));
    }

    #[tokio::test]
    async fn test_manager_handles_link_loss_in_background() {
        init_logging();
        let bus = EventBus::new();
        let radio = SimRadio::new(bus.clone());
        radio.add_network(SimNetwork::new("Home", "password123"));
        let mut manager = ConnectionManager::new(
            radio.clone(),
            store_with(&["Home"]),
            bus,
            StationConfig::default(),
        );
        manager.start().await.unwrap();

        radio.drop_link();
        for _ in 0..50 {
            if radio.count(&RadioCall::Connect) == 2 && manager.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(radio.count(&RadioCall::Connect), 2);
        assert!(manager.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_replaces_dispatcher() {
        init_logging();
        let bus = EventBus::new();
        let radio = SimRadio::new(bus.clone());
        radio.add_network(SimNetwork::new("Home", "password123"));
        let store = store_with(&["Home"]);
        let mut manager = ConnectionManager::new(
            radio.clone(),
            Arc::clone(&store),
            bus.clone(),
            StationConfig::default(),
        );

        manager.start().await.unwrap();
        assert_eq!(bus.subscribers(), 1);

        // The first dispatcher is gone before the second episode begins
        let outcome = manager.start().await.unwrap();
        assert!(matches!(outcome, StationOutcome::Connected { slot: 0, .. }));
        assert_eq!(bus.subscribers(), 1);
        assert_eq!(radio.count(&RadioCall::StartScan), 2);
        assert_eq!(radio.count(&RadioCall::Connect), 2);
        assert_eq!(score(&store, 0), Some(2));
    }

    #[tokio::test]
    async fn test_drop_stops_dispatcher() {
        init_logging();
        let bus = EventBus::new();
        let radio = SimRadio::new(bus.clone());
        radio.add_network(SimNetwork::new("Home", "password123"));
        let mut manager = ConnectionManager::new(
            radio.clone(),
            store_with(&["Home"]),
            bus.clone(),
            StationConfig::default(),
        );
        manager.start().await.unwrap();
        let cancel = manager.cancel_token();
        assert_eq!(bus.subscribers(), 1);

        drop(manager);
        assert!(cancel.is_cancelled());
        for _ in 0..50 {
            if bus.subscribers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bus.subscribers(), 0);

        // Nobody reconnects a dropped link any more
        radio.drop_link();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(radio.count(&RadioCall::Connect), 1);
    }

    #[tokio::test]
    async fn test_manager_cancel() {
        init_logging();
        let bus = EventBus::new();
        // Radio that never answers: nothing subscribed publishes events
        let radio = SimRadio::new(EventBus::new());
        let mut manager =
            ConnectionManager::new(radio, store_with(&["Home"]), bus, StationConfig::default());

        let cancel = manager.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        assert!(matches!(manager.start().await, Err(WifiError::Cancelled)));
        assert!(matches!(manager.start().await, Err(WifiError::Cancelled)));
    }
}
