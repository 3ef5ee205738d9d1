//! WiFi module
//!
//! The connectivity manager drives the radio through the station / provisioning
//! state machine. Network-stack callbacks are turned into [`RadioEvent`]s on a
//! channel that only the manager consumes, and the manager republishes the
//! resulting up/down transitions as [`NetworkEvent`]s to every subscriber.
//!
//! ```text
//! Idle ──start──▶ Connecting ──GotIp──▶ Connected
//!                  │  ▲    │               │
//!     Disconnected │  └────┘ retry < max   │ Disconnected
//!     retry >= max ▼                       ▼
//!                Failed ──▶ ProvisioningAP  Connecting
//! ```

use core::fmt::Write as _;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use heapless::String;
use log::{debug, error, info, warn};

use crate::config::WiFiConfig;
use crate::error::Result;
use crate::storage::{CredentialStore, Credentials};

/// State of the connectivity manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    ProvisioningAP,
    Failed,
}

/// Events produced by the network stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    /// Station interface started, a connect request may be issued
    StaStarted,
    /// Station got an address from DHCP
    GotIp,
    /// Station lost (or never reached) its access point
    StaDisconnected,
}

/// Which kind of network is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Station,
    AccessPoint,
}

/// Up/down notification delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Up(LinkMode),
    Down,
}

/// Access point parameters derived for provisioning mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String<32>,
    pub password: String<64>,
    pub channel: u8,
    pub max_connections: u16,
}

/// Commands the connectivity manager issues to the radio
pub trait Radio: Send {
    /// Configure station mode with the given credentials
    fn configure_station(&mut self, credentials: &Credentials) -> Result<()>;
    /// Start the configured interface; station mode answers with [`RadioEvent::StaStarted`]
    fn start(&mut self) -> Result<()>;
    /// Issue a connect request; the outcome arrives as a [`RadioEvent`]
    fn connect(&mut self) -> Result<()>;
    /// Stop whichever mode is running
    fn stop(&mut self) -> Result<()>;
    /// Switch to access point mode and start it
    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<()>;
    /// Factory MAC address
    fn mac_address(&self) -> [u8; 6];
}

/// Channel carrying network-stack events to the manager
pub fn radio_channel() -> (Sender<RadioEvent>, Receiver<RadioEvent>) {
    mpsc::channel()
}

/// Fan-out of [`NetworkEvent`]s, in emission order, to every subscriber
#[derive(Clone, Default)]
pub struct NetworkNotifier {
    subscribers: Arc<Mutex<Vec<Sender<NetworkEvent>>>>,
}

impl NetworkNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Receiver<NetworkEvent> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(_) => error!("Failed to lock network subscribers"),
        }
        rx
    }

    /// Deliver an event; subscribers whose receiver is gone are dropped
    pub fn notify(&self, event: NetworkEvent) {
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.retain(|tx| tx.send(event).is_ok());
                debug!("{:?} delivered to {} subscriber(s)", event, subscribers.len());
            }
            Err(_) => error!("Failed to lock network subscribers, {:?} lost", event),
        }
    }
}

/// Derive the provisioning SSID: prefix followed by the first three MAC bytes in hex
pub fn ap_ssid_from_mac(prefix: &str, mac: &[u8; 6]) -> String<32> {
    let mut ssid = String::new();
    if write!(ssid, "{}{:02x}{:02x}{:02x}", prefix, mac[0], mac[1], mac[2]).is_err() {
        warn!("Access point SSID truncated to '{}'", ssid);
    }
    ssid
}

/// WiFi connectivity manager
pub struct WiFiManager<R: Radio> {
    radio: R,
    events: Receiver<RadioEvent>,
    store: Arc<dyn CredentialStore>,
    config: WiFiConfig,
    state: ConnectionState,
    retry_count: u32,
    notifier: NetworkNotifier,
}

impl<R: Radio> WiFiManager<R> {
    /// Create a manager owning the radio and the receiving end of its event channel
    pub fn new(
        radio: R,
        events: Receiver<RadioEvent>,
        store: Arc<dyn CredentialStore>,
        config: WiFiConfig,
    ) -> Self {
        Self {
            radio,
            events,
            store,
            config,
            state: ConnectionState::Idle,
            retry_count: 0,
            notifier: NetworkNotifier::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn subscribe(&self) -> Receiver<NetworkEvent> {
        self.notifier.subscribe()
    }

    /// Join the configured network. Blocks until `Connected` or `Failed`;
    /// on failure station mode is torn down again.
    pub fn connect_station(&mut self) -> bool {
        match self.state {
            ConnectionState::Connected => return true,
            ConnectionState::ProvisioningAP => {
                warn!("Station connect requested while the access point is up, ignoring");
                return false;
            }
            _ => {}
        }

        let credentials = Credentials::load(self.store.as_ref(), &self.config);
        info!("Connecting to '{}' in station mode", credentials.ssid);

        self.retry_count = 0;
        self.set_state(ConnectionState::Connecting);

        let started = self
            .radio
            .configure_station(&credentials)
            .and_then(|_| self.radio.start());
        if let Err(e) = started {
            error!("Failed to start station mode: {}", e);
            self.set_state(ConnectionState::Failed);
        }

        while self.state == ConnectionState::Connecting {
            match self.events.recv() {
                Ok(event) => self.handle_event(event),
                Err(_) => {
                    error!("Radio event channel closed");
                    self.set_state(ConnectionState::Failed);
                }
            }
        }

        if self.state == ConnectionState::Connected {
            return true;
        }

        self.teardown_station();
        false
    }

    /// Feed one network-stack event through the state machine
    pub fn handle_event(&mut self, event: RadioEvent) {
        debug!("Radio event {:?} in state {:?}", event, self.state);

        match (event, self.state) {
            (RadioEvent::StaStarted, ConnectionState::Connecting) => self.request_connect(),
            (RadioEvent::GotIp, ConnectionState::Connecting) => {
                self.retry_count = 0;
                self.set_state(ConnectionState::Connected);
                self.notifier.notify(NetworkEvent::Up(LinkMode::Station));
            }
            (RadioEvent::StaDisconnected, ConnectionState::Connected) => {
                warn!("Station link lost");
                self.notifier.notify(NetworkEvent::Down);
                self.set_state(ConnectionState::Connecting);
                self.retry_or_fail();
            }
            (RadioEvent::StaDisconnected, ConnectionState::Connecting) => self.retry_or_fail(),
            _ => debug!("Ignoring {:?} in state {:?}", event, self.state),
        }
    }

    /// Keep consuming network-stack events after the initial connect.
    /// Station failures fall back to provisioning mode. Returns once the
    /// event channel is closed.
    pub fn supervise(&mut self) {
        info!("Supervising WiFi link in state {:?}", self.state);

        while let Ok(event) = self.events.recv() {
            self.handle_event(event);

            if self.state == ConnectionState::Failed {
                self.teardown_station();
                if let Err(e) = self.start_access_point() {
                    error!("Failed to start provisioning access point: {}", e);
                }
            }
        }

        warn!("Radio event channel closed, WiFi supervision stopped");
    }

    /// Settings the provisioning access point would use on this device
    pub fn access_point_settings(&self) -> AccessPointSettings {
        let ssid = ap_ssid_from_mac(self.config.ap_ssid_prefix, &self.radio.mac_address());
        let password = String::try_from(ssid.as_str()).unwrap_or_default();

        AccessPointSettings {
            ssid,
            password,
            channel: self.config.ap_channel,
            max_connections: self.config.ap_max_connections,
        }
    }

    /// Switch to provisioning mode. No-op when it is already running.
    ///
    /// The passphrase equals the SSID, a known weak default so a freshly
    /// flashed device can be reached without any prior configuration.
    pub fn start_access_point(&mut self) -> Result<()> {
        if self.state == ConnectionState::ProvisioningAP {
            debug!("Access point already running");
            return Ok(());
        }

        if self.state == ConnectionState::Connected {
            self.notifier.notify(NetworkEvent::Down);
        }
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            self.teardown_station();
        }

        let settings = self.access_point_settings();
        if let Err(e) = self.radio.start_access_point(&settings) {
            self.set_state(ConnectionState::Failed);
            return Err(e);
        }

        info!("Provisioning access point '{}' started", settings.ssid);
        self.set_state(ConnectionState::ProvisioningAP);
        self.notifier.notify(NetworkEvent::Up(LinkMode::AccessPoint));
        Ok(())
    }

    /// Leave provisioning mode and go back to `Idle`
    pub fn stop_access_point(&mut self) -> Result<()> {
        if self.state != ConnectionState::ProvisioningAP {
            return Ok(());
        }

        self.radio.stop()?;
        self.set_state(ConnectionState::Idle);
        self.notifier.notify(NetworkEvent::Down);
        Ok(())
    }

    fn request_connect(&mut self) {
        if let Err(e) = self.radio.connect() {
            warn!("Connect request rejected: {}", e);
            self.retry_or_fail();
        }
    }

    fn retry_or_fail(&mut self) {
        if self.retry_count < self.config.max_retries {
            self.retry_count += 1;
            warn!(
                "Station connect failed, retry {}/{}",
                self.retry_count, self.config.max_retries
            );
            self.request_connect();
        } else {
            error!("Station connect failed after {} retries", self.retry_count);
            self.set_state(ConnectionState::Failed);
        }
    }

    fn teardown_station(&mut self) {
        if let Err(e) = self.radio.stop() {
            warn!("Failed to stop station mode: {}", e);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("WiFi state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspRadio;

#[cfg(target_os = "espidf")]
mod esp {
    use std::sync::mpsc::Sender;

    use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
    use esp_idf_svc::hal::modem::Modem;
    use esp_idf_svc::netif::IpEvent;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::wifi::{
        AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent,
    };
    use log::{info, warn};

    use super::{AccessPointSettings, Radio, RadioEvent};
    use crate::error::{Error, Result};
    use crate::storage::Credentials;

    /// Radio backed by the ESP-IDF WiFi driver
    pub struct EspRadio {
        wifi: EspWifi<'static>,
        _wifi_events: EspSubscription<'static, System>,
        _ip_events: EspSubscription<'static, System>,
    }

    impl EspRadio {
        /// Create the driver and forward its station events into `events`
        pub fn new(
            modem: Modem,
            sysloop: EspSystemEventLoop,
            nvs: EspDefaultNvsPartition,
            events: Sender<RadioEvent>,
        ) -> Result<Self> {
            let wifi = EspWifi::new(modem, sysloop.clone(), Some(nvs))?;

            let wifi_tx = events.clone();
            let wifi_events = sysloop.subscribe::<WifiEvent, _>(move |event| {
                let forwarded = match event {
                    WifiEvent::StaStarted => Some(RadioEvent::StaStarted),
                    WifiEvent::StaDisconnected(_) => Some(RadioEvent::StaDisconnected),
                    _ => None,
                };
                if let Some(event) = forwarded {
                    let _ = wifi_tx.send(event);
                }
            })?;

            let ip_events = sysloop.subscribe::<IpEvent, _>(move |event| {
                if let IpEvent::DhcpIpAssigned(_) = event {
                    let _ = events.send(RadioEvent::GotIp);
                }
            })?;

            Ok(Self {
                wifi,
                _wifi_events: wifi_events,
                _ip_events: ip_events,
            })
        }
    }

    impl Radio for EspRadio {
        fn configure_station(&mut self, credentials: &Credentials) -> Result<()> {
            let auth_method = if credentials.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            };

            self.wifi.set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials.ssid.clone(),
                password: credentials.password.clone(),
                auth_method,
                ..Default::default()
            }))
            .map_err(|e| Error::WiFiError(format!("Failed to configure station mode: {}", e)))?;
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            self.wifi.start()?;
            Ok(())
        }

        fn connect(&mut self) -> Result<()> {
            self.wifi.connect()?;
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.wifi.stop()?;
            Ok(())
        }

        fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<()> {
            self.wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: settings.ssid.clone(),
                password: settings.password.clone(),
                auth_method: AuthMethod::WPAWPA2Personal,
                channel: settings.channel,
                max_connections: settings.max_connections,
                ..Default::default()
            }))
            .map_err(|e| Error::WiFiError(format!("Failed to configure access point: {}", e)))?;
            self.wifi.start()?;

            if let Ok(ip_info) = self.wifi.ap_netif().get_ip_info() {
                info!("AP IP address: {}", ip_info.ip);
            }
            Ok(())
        }

        fn mac_address(&self) -> [u8; 6] {
            let mut mac = [0u8; 6];
            let err = unsafe { esp_idf_sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
            if err != esp_idf_sys::ESP_OK {
                warn!("Failed to read factory MAC (error code: {})", err);
            }
            mac
        }
    }
}

#[cfg(not(target_os = "espidf"))]
pub use sim::{SimRadio, SimRadioLog};

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::collections::VecDeque;
    use std::sync::mpsc::Sender;

    use log::info;

    use super::{AccessPointSettings, Radio, RadioEvent};
    use crate::error::Result;
    use crate::storage::Credentials;

    /// Everything the simulated radio was asked to do
    #[derive(Debug, Clone, Default)]
    pub struct SimRadioLog {
        pub station: Option<Credentials>,
        pub access_point: Option<AccessPointSettings>,
        pub connect_attempts: u32,
        pub starts: u32,
        pub stops: u32,
    }

    /// Host-side radio answering connect requests from a script of outcomes
    pub struct SimRadio {
        events: Sender<RadioEvent>,
        outcomes: VecDeque<bool>,
        mac: [u8; 6],
        log: SimRadioLog,
    }

    impl SimRadio {
        pub fn new(events: Sender<RadioEvent>, mac: [u8; 6]) -> Self {
            Self {
                events,
                outcomes: VecDeque::new(),
                mac,
                log: SimRadioLog::default(),
            }
        }

        /// Outcome of each successive connect request: `true` yields an
        /// address, `false` a disconnect. Unscripted attempts fail.
        pub fn with_outcomes(mut self, outcomes: impl IntoIterator<Item = bool>) -> Self {
            self.outcomes.extend(outcomes);
            self
        }

        pub fn log(&self) -> &SimRadioLog {
            &self.log
        }
    }

    impl Radio for SimRadio {
        fn configure_station(&mut self, credentials: &Credentials) -> Result<()> {
            self.log.station = Some(credentials.clone());
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            self.log.starts += 1;
            let _ = self.events.send(RadioEvent::StaStarted);
            Ok(())
        }

        fn connect(&mut self) -> Result<()> {
            self.log.connect_attempts += 1;
            let event = if self.outcomes.pop_front().unwrap_or(false) {
                RadioEvent::GotIp
            } else {
                RadioEvent::StaDisconnected
            };
            info!("WiFi(sim): connect attempt {} -> {:?}", self.log.connect_attempts, event);
            let _ = self.events.send(event);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.log.stops += 1;
            Ok(())
        }

        fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<()> {
            self.log.access_point = Some(settings.clone());
            Ok(())
        }

        fn mac_address(&self) -> [u8; 6] {
            self.mac
        }
    }
}
