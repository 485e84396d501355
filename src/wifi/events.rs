//! Radio and provisioning events, and the bus that carries them.

use super::Bssid;
use crate::config::Credential;
use log::debug;
use std::fmt;
use std::net::Ipv4Addr;
use tokio::sync::broadcast;

/// Events buffered per subscriber before the oldest are dropped.
pub const EVENT_BUS_CAPACITY: usize = 64;

/// Security mode advertised by an access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa3Psk,
    Wpa2Wpa3Psk,
    Wpa2Enterprise,
    Unknown,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Wep => "WEP",
            Self::WpaPsk => "WPA-PSK",
            Self::Wpa2Psk => "WPA2-PSK",
            Self::WpaWpa2Psk => "WPA/WPA2-PSK",
            Self::Wpa3Psk => "WPA3-PSK",
            Self::Wpa2Wpa3Psk => "WPA2/WPA3-PSK",
            Self::Wpa2Enterprise => "WPA2-Enterprise",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One scan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleNetwork {
    pub ssid: String,
    /// Signal strength in dBm.
    pub rssi: i8,
    pub auth: AuthMode,
}

/// Events emitted by the station radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Station mode is up.
    StationStarted,
    /// A scan finished.
    ScanComplete(Vec<VisibleNetwork>),
    /// Association failed or was lost.
    Disconnected,
    /// DHCP assigned an address.
    GotIp(Ipv4Addr),
}

/// Events emitted by the out-of-band provisioning listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    /// The listener finished its channel sweep.
    ScanStageDone,
    /// The listener locked onto the sender's channel.
    ChannelFound,
    /// A credential was received, optionally bound to one access point.
    CredentialDecoded {
        credential: Credential,
        bssid: Option<Bssid>,
    },
    /// The phone was told the device joined the network.
    AckSent,
}

/// Anything a state machine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Radio(RadioEvent),
    Provisioning(ProvisioningEvent),
}

impl From<RadioEvent> for Event {
    fn from(event: RadioEvent) -> Self {
        Self::Radio(event)
    }
}

impl From<ProvisioningEvent> for Event {
    fn from(event: ProvisioningEvent) -> Self {
        Self::Provisioning(event)
    }
}

/// Fan-out channel from event producers (driver callbacks, simulator) to
/// state machines.
///
/// Cloning yields another handle to the same bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with [`EVENT_BUS_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    /// Create a bus buffering `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Deliver an event to every current subscriber.
    ///
    /// Events published while nobody is subscribed are dropped.
    pub fn publish(&self, event: impl Into<Event>) {
        let event = event.into();
        debug!("Event: {:?}", event);
        let _ = self.tx.send(event);
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_see_events_after_subscribing() {
        let bus = EventBus::new();
        bus.publish(RadioEvent::StationStarted);

        let mut rx = bus.subscribe();
        bus.publish(RadioEvent::Disconnected);

        assert_eq!(rx.try_recv().unwrap(), Event::Radio(RadioEvent::Disconnected));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fan_out() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.clone().subscribe();
        assert_eq!(bus.subscribers(), 2);

        bus.publish(ProvisioningEvent::AckSent);
        assert_eq!(a.try_recv().unwrap(), Event::Provisioning(ProvisioningEvent::AckSent));
        assert_eq!(b.try_recv().unwrap(), Event::Provisioning(ProvisioningEvent::AckSent));
    }

    #[test]
    fn test_overflow_reports_lag() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for _ in 0..3 {
            bus.publish(RadioEvent::Disconnected);
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
    }

    #[test]
    fn test_decoded_credential_debug_hides_password() {
        let event = ProvisioningEvent::CredentialDecoded {
            credential: Credential::new("Home", "hunter22").unwrap(),
            bssid: None,
        };
        let text = format!("{:?}", event);
        assert!(text.contains("Home"));
        assert!(!text.contains("hunter22"));
    }
}
