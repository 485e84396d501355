//! Out-of-band provisioning.
//!
//! The session shows the provisioning hint, brings up station mode and starts
//! the listener. A delivered credential is used directly (no matching against
//! the table). On an address the credential is written to the table and a
//! restart is scheduled, so the device boots into the normal station flow.
//! If the credential never connects, a restart is scheduled without writing
//! anything.

use super::dispatch::{self, spawn_dispatcher, wait_outcome, Dispatcher, Transitions, Verdict};
use super::{
    Bssid, Event, EventBus, ProvisioningEvent, ProvisioningListener, Radio, RadioEvent, Restarter,
    StatusSink, WifiError,
};
use crate::config::{Credential, ProvisioningConfig};
use crate::credentials::{self, SharedStore};
use crate::storage::KvStore;
use log::{debug, error, info, warn};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Where the provisioning flow is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    /// Waiting for station mode to come up.
    Starting,
    /// Waiting for a credential from the phone.
    Listening,
    /// Joining the network named by the delivered credential.
    Connecting,
    /// Joined and persisted; restart pending.
    Acknowledged,
    /// Gave up; restart pending.
    Failed,
}

/// How a provisioning `start()` call ended. A restart is pending either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// The credential connected and was stored in `slot`.
    Provisioned {
        slot: usize,
        ssid: String,
        ip: Ipv4Addr,
    },
    /// The delivered credential never connected.
    ConnectFailed { ssid: String },
}

/// Transition function of the provisioning flow.
pub struct ProvisioningMachine<R: Radio, L: ProvisioningListener, S: KvStore> {
    radio: R,
    listener: L,
    store: SharedStore<S>,
    restarter: Arc<dyn Restarter>,
    status: Arc<dyn StatusSink>,
    config: ProvisioningConfig,
    state: ProvisioningState,
    listening: bool,
    reconnects: u8,
    pending: Option<Credential>,
}

impl<R, L, S> ProvisioningMachine<R, L, S>
where
    R: Radio,
    L: ProvisioningListener,
    S: KvStore,
{
    pub fn new(
        radio: R,
        listener: L,
        store: SharedStore<S>,
        restarter: Arc<dyn Restarter>,
        status: Arc<dyn StatusSink>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            radio,
            listener,
            store,
            restarter,
            status,
            config,
            state: ProvisioningState::Idle,
            listening: false,
            reconnects: 0,
            pending: None,
        }
    }

    /// Show the hint and bring up station mode.
    pub fn begin(&mut self) -> Option<Verdict<ProvisioningOutcome>> {
        self.reconnects = 0;
        self.pending = None;
        if let Err(e) = self.config.validate() {
            error!("Provisioning not started: {}", e);
            return Some(Err(e.into()));
        }
        self.status.show(&self.config.hint.to_string());

        info!("Provisioning: starting station");
        self.state = ProvisioningState::Starting;
        match self.radio.start_station() {
            Ok(()) => None,
            Err(e) => self.abort(e.into()),
        }
    }

    fn listen(&mut self) -> Option<Verdict<ProvisioningOutcome>> {
        if let Err(e) = self.listener.start() {
            return self.abort(e.into());
        }
        self.listening = true;
        self.state = ProvisioningState::Listening;
        info!("Provisioning: waiting for credentials");
        None
    }

    fn on_credential(
        &mut self,
        credential: &Credential,
        bssid: Option<Bssid>,
    ) -> Option<Verdict<ProvisioningOutcome>> {
        if let Err(e) = credential.validate() {
            warn!("Ignoring delivered credential: {}", e);
            return None;
        }
        info!(
            "Provisioning: received credentials for {}{}",
            credential.ssid,
            if bssid.is_some() { " (fixed AP)" } else { "" }
        );

        if let Err(e) = self.radio.disconnect() {
            warn!("Disconnect before provisioning connect failed: {}", e);
        }
        let issued = self
            .radio
            .set_config(credential, bssid)
            .and_then(|()| self.radio.connect());
        if let Err(e) = issued {
            return self.abort(e.into());
        }

        self.pending = Some(credential.clone());
        self.reconnects = 0;
        self.state = ProvisioningState::Connecting;
        None
    }

    fn on_disconnected(&mut self) -> Option<Verdict<ProvisioningOutcome>> {
        let ssid = self.pending.as_ref()?.ssid.clone();

        if self.reconnects < self.config.max_reconnects {
            self.reconnects += 1;
            info!(
                "Provisioning: reconnecting to {} ({}/{})",
                ssid, self.reconnects, self.config.max_reconnects
            );
            return match self.radio.connect() {
                Ok(()) => None,
                Err(e) => self.abort(e.into()),
            };
        }

        error!(
            "Provisioning: could not connect to {} after {} reconnect(s)",
            ssid, self.reconnects
        );
        self.pending = None;
        self.state = ProvisioningState::Failed;
        self.stop_listener();
        self.restarter.schedule_restart(self.config.restart_delay);
        Some(Ok(ProvisioningOutcome::ConnectFailed { ssid }))
    }

    fn on_got_ip(&mut self, ip: Ipv4Addr) -> Option<Verdict<ProvisioningOutcome>> {
        let credential = self.pending.take()?;
        info!("Provisioning: connected to {}, IP {}", credential.ssid, ip);
        self.state = ProvisioningState::Acknowledged;

        let stored = {
            let mut store = credentials::lock(&self.store);
            let slot = store.find_slot_for_write(&credential.ssid);
            store.write(slot, &credential).map(|()| slot)
        };
        self.restarter.schedule_restart(self.config.restart_delay);

        match stored {
            Ok(slot) => Some(Ok(ProvisioningOutcome::Provisioned {
                slot,
                ssid: credential.ssid.clone(),
                ip,
            })),
            Err(e) => {
                error!("Provisioning: failed to store credentials: {}", e);
                Some(Err(e.into()))
            }
        }
    }

    fn stop_listener(&mut self) {
        if !self.listening {
            return;
        }
        match self.listener.stop() {
            Ok(()) => debug!("Provisioning listener stopped"),
            Err(e) => warn!("Failed to stop provisioning listener: {}", e),
        }
        self.listening = false;
    }

    /// Unrecoverable: restart and try again from boot.
    fn abort(&mut self, e: WifiError) -> Option<Verdict<ProvisioningOutcome>> {
        error!("Provisioning aborted: {}", e);
        self.pending = None;
        self.state = ProvisioningState::Failed;
        self.stop_listener();
        self.restarter.schedule_restart(self.config.restart_delay);
        Some(Err(e))
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Check whether the listener is running.
    pub fn is_listening(&self) -> bool {
        self.listening
    }
}

impl<R, L, S> Transitions for ProvisioningMachine<R, L, S>
where
    R: Radio + 'static,
    L: ProvisioningListener + 'static,
    S: KvStore + 'static,
{
    type Outcome = ProvisioningOutcome;

    const NAME: &'static str = "Provisioning";

    fn handle(&mut self, event: &Event) -> Option<Verdict<ProvisioningOutcome>> {
        use ProvisioningState as State;

        match (self.state, event) {
            (State::Starting, Event::Radio(RadioEvent::StationStarted)) => self.listen(),
            (State::Listening, Event::Provisioning(ProvisioningEvent::ScanStageDone)) => {
                debug!("Provisioning: channel sweep done");
                None
            }
            (State::Listening, Event::Provisioning(ProvisioningEvent::ChannelFound)) => {
                info!("Provisioning: found sender channel");
                None
            }
            (
                State::Listening | State::Connecting,
                Event::Provisioning(ProvisioningEvent::CredentialDecoded { credential, bssid }),
            ) => self.on_credential(credential, *bssid),
            (State::Connecting, Event::Radio(RadioEvent::Disconnected)) => self.on_disconnected(),
            (State::Connecting, Event::Radio(RadioEvent::GotIp(ip))) => self.on_got_ip(*ip),
            (_, Event::Provisioning(ProvisioningEvent::AckSent)) => {
                info!("Provisioning: phone acknowledged");
                self.stop_listener();
                None
            }
            (state, event) => {
                debug!("Provisioning ignoring {:?} in {:?}", event, state);
                None
            }
        }
    }
}

/// Acquires a credential out of band and persists it.
///
/// Owns a [`ProvisioningMachine`] and the dispatcher task feeding it.
/// Dropping the session stops the dispatcher.
pub struct ProvisioningSession<R, L, S>
where
    R: Radio + 'static,
    L: ProvisioningListener + 'static,
    S: KvStore + 'static,
{
    machine: Arc<Mutex<ProvisioningMachine<R, L, S>>>,
    bus: EventBus,
    cancel: CancellationToken,
    dispatcher: Option<Dispatcher>,
}

impl<R, L, S> ProvisioningSession<R, L, S>
where
    R: Radio + 'static,
    L: ProvisioningListener + 'static,
    S: KvStore + 'static,
{
    pub fn new(
        radio: R,
        listener: L,
        store: SharedStore<S>,
        bus: EventBus,
        restarter: Arc<dyn Restarter>,
        status: Arc<dyn StatusSink>,
        config: ProvisioningConfig,
    ) -> Self {
        let machine = ProvisioningMachine::new(radio, listener, store, restarter, status, config);
        Self {
            machine: Arc::new(Mutex::new(machine)),
            bus,
            cancel: CancellationToken::new(),
            dispatcher: None,
        }
    }

    /// Token that cancels a pending [`start`](Self::start) and stops the
    /// dispatcher.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until a credential is persisted or given up on.
    ///
    /// Either way a restart has been scheduled when this resolves; the caller
    /// only has to keep the session alive until it happens so the listener
    /// can be stopped once the phone is acknowledged.
    pub async fn start(&mut self) -> Result<ProvisioningOutcome, WifiError> {
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

    pub fn state(&self) -> ProvisioningState {
        dispatch::lock(&self.machine).state()
    }

    pub fn is_listening(&self) -> bool {
        dispatch::lock(&self.machine).is_listening()
    }
}

impl<R, L, S> Drop for ProvisioningSession<R, L, S>
where
    R: Radio + 'static,
    L: ProvisioningListener + 'static,
    S: KvStore + 'static,
{
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
