use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BridgeError, Result},
    protocol::{decode_bike_features, BIKE_INIT_SEQUENCE},
    types::{
        BikeCharacteristic, BikeCharacteristics, BridgeConfig, CentralConnectionState,
        CharacteristicHandle, DiscoveredDevice, DiscoveryReport, ServiceHandle,
    },
    BIKE_CUSTOM_SERVICE_UUID, FTMS_SERVICE_UUID,
};

/// Bike-facing BLE operations.
///
/// Implementations report asynchronous happenings (advertisements, link loss,
/// notifications from subscribed characteristics) as
/// [`BikeEvent`](crate::types::BikeEvent)s on the bridge's event channel.
#[async_trait]
pub trait CentralTransport: Send + Sync {
    /// Start scanning for advertisements
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning; a no-op when not scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Whether a scan is running
    async fn is_scanning(&self) -> bool;

    /// Connect to the device with the given address
    async fn connect(&self, address: &str) -> Result<()>;

    /// Drop the current link
    async fn disconnect(&self) -> Result<()>;

    /// Look up a primary service on the connected device
    async fn discover_service(&self, uuid: Uuid) -> Result<Option<ServiceHandle>>;

    /// Look up a characteristic inside a discovered service
    async fn get_characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicHandle>>;

    /// Enable notifications; values arrive as notification events
    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<()>;

    /// Write a value
    async fn write_value(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Read a value
    async fn read_value(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>>;
}

/// How a discovery report moved the lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Primary data path is live
    Ready {
        /// Bike control point, if one was found
        control_point: Option<CharacteristicHandle>,
    },
    /// Primary data path missing; the link must be torn down
    Fatal,
    /// Report arrived for a link that no longer exists
    Stale,
}

/// Bike-facing connection state machine.
///
/// Pure bookkeeping: the bridge performs the transport calls each transition
/// asks for and feeds completions back in.
#[derive(Debug)]
pub struct CentralLifecycle {
    state: CentralConnectionState,
    target: Option<DiscoveredDevice>,
    attempting_connection: bool,
    characteristics: BikeCharacteristics,
    feature_notifications_enabled: bool,
    custom_data_notifications_enabled: bool,
}

impl Default for CentralLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralLifecycle {
    /// Start in `Idle`
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: CentralConnectionState::Idle,
            target: None,
            attempting_connection: false,
            characteristics: BikeCharacteristics {
                ftms_data: None,
                control_point: None,
                ftms_feature: None,
                custom_data: None,
            },
            feature_notifications_enabled: false,
            custom_data_notifications_enabled: false,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> CentralConnectionState {
        self.state
    }

    /// Bike found by the last scan
    #[must_use]
    pub const fn target(&self) -> Option<&DiscoveredDevice> {
        self.target.as_ref()
    }

    /// Whether a connect attempt is outstanding
    #[must_use]
    pub const fn is_attempting_connection(&self) -> bool {
        self.attempting_connection
    }

    /// Characteristics located by discovery
    #[must_use]
    pub const fn characteristics(&self) -> &BikeCharacteristics {
        &self.characteristics
    }

    /// Whether the bike's 0x2AD2 notifications are on
    #[must_use]
    pub const fn feature_notifications_enabled(&self) -> bool {
        self.feature_notifications_enabled
    }

    /// Whether the bike's 0xFFF1 notifications are on
    #[must_use]
    pub const fn custom_data_notifications_enabled(&self) -> bool {
        self.custom_data_notifications_enabled
    }

    /// Whether bike notifications should be processed.
    ///
    /// Subscriptions are made while still `Connected`, so notifications can
    /// arrive before the discovery report does.
    #[must_use]
    pub const fn accepts_notifications(&self) -> bool {
        matches!(
            self.state,
            CentralConnectionState::Connected
                | CentralConnectionState::ServicesDiscovered
                | CentralConnectionState::Ready
        )
    }

    fn transition(&mut self, next: CentralConnectionState) {
        if self.state != next {
            info!("Bike connection: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    const fn rejected(&self, event: &'static str) -> BridgeError {
        BridgeError::InvalidTransition {
            from: self.state,
            event,
        }
    }

    /// Handle a scan request.
    ///
    /// Returns `true` when the transport should start scanning and `false`
    /// when a scan is already running.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`] outside `Idle` and `Scanning`.
    pub fn request_scan(&mut self) -> Result<bool> {
        match self.state {
            CentralConnectionState::Idle => {
                self.transition(CentralConnectionState::Scanning);
                Ok(true)
            }
            CentralConnectionState::Scanning => Ok(false),
            _ => Err(self.rejected("scan")),
        }
    }

    /// The transport could not start the scan
    pub fn scan_failed(&mut self) {
        if self.state == CentralConnectionState::Scanning {
            self.transition(CentralConnectionState::Idle);
        }
    }

    /// Handle an advertisement.
    ///
    /// Returns `true` when it is the configured bike; the caller must then stop
    /// scanning before connecting.
    pub fn on_device_discovered(
        &mut self,
        device: DiscoveredDevice,
        config: &BridgeConfig,
    ) -> bool {
        if self.state != CentralConnectionState::Scanning || !config.matches_bike(&device.address) {
            return false;
        }

        info!(
            "Found bike {} ({}), RSSI {:?}",
            device.address,
            device.name.as_deref().unwrap_or("unnamed"),
            device.rssi
        );
        self.target = Some(device);
        self.transition(CentralConnectionState::TargetFound);
        true
    }

    /// Handle a connect request.
    ///
    /// Returns the address to connect to, or `None` when an attempt is
    /// already in flight or the link is already up.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`] when no bike has been found.
    pub fn request_connect(&mut self) -> Result<Option<String>> {
        if self.attempting_connection
            || matches!(
                self.state,
                CentralConnectionState::Connecting
                    | CentralConnectionState::Connected
                    | CentralConnectionState::ServicesDiscovered
                    | CentralConnectionState::Ready
            )
        {
            debug!("Connect request ignored in state {}", self.state);
            return Ok(None);
        }

        let address = match (&self.state, &self.target) {
            (CentralConnectionState::TargetFound, Some(target)) => target.address.clone(),
            _ => return Err(self.rejected("connect")),
        };

        self.attempting_connection = true;
        self.transition(CentralConnectionState::Connecting);
        Ok(Some(address))
    }

    /// Transport connect succeeded; `false` if no attempt was pending
    pub fn on_connected(&mut self) -> bool {
        if self.state != CentralConnectionState::Connecting {
            debug!("Ignoring stale connect success in state {}", self.state);
            return false;
        }
        self.transition(CentralConnectionState::Connected);
        true
    }

    /// Transport connect failed; `false` if no attempt was pending
    pub fn on_connect_failed(&mut self) -> bool {
        if self.state != CentralConnectionState::Connecting {
            debug!("Ignoring stale connect failure in state {}", self.state);
            return false;
        }
        self.clear();
        true
    }

    /// Apply the result of the discovery procedure
    pub fn on_discovery(&mut self, report: DiscoveryReport) -> DiscoveryOutcome {
        if self.state != CentralConnectionState::Connected {
            debug!("Ignoring stale discovery report in state {}", self.state);
            return DiscoveryOutcome::Stale;
        }

        self.characteristics = report.characteristics;
        self.feature_notifications_enabled = report.feature_subscribed;
        self.custom_data_notifications_enabled = report.primary_subscribed;
        self.transition(CentralConnectionState::ServicesDiscovered);

        if report.primary_subscribed {
            self.attempting_connection = false;
            self.transition(CentralConnectionState::Ready);
            DiscoveryOutcome::Ready {
                control_point: self.characteristics.control_point.clone(),
            }
        } else {
            warn!("Primary data path unavailable, dropping bike link");
            self.transition(CentralConnectionState::Disconnecting);
            DiscoveryOutcome::Fatal
        }
    }

    /// Handle a local disconnect request.
    ///
    /// Returns `true` when there is a link (or link attempt) for the transport
    /// to tear down. Without one the lifecycle goes straight back to `Idle`.
    pub fn begin_disconnect(&mut self) -> bool {
        match self.state {
            CentralConnectionState::Connecting
            | CentralConnectionState::Connected
            | CentralConnectionState::ServicesDiscovered
            | CentralConnectionState::Ready
            | CentralConnectionState::Disconnecting => {
                self.transition(CentralConnectionState::Disconnecting);
                true
            }
            CentralConnectionState::Idle
            | CentralConnectionState::Scanning
            | CentralConnectionState::TargetFound => {
                self.clear();
                false
            }
        }
    }

    /// Link dropped, from any state
    pub fn on_disconnected(&mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        self.target = None;
        self.attempting_connection = false;
        self.characteristics = BikeCharacteristics::default();
        self.feature_notifications_enabled = false;
        self.custom_data_notifications_enabled = false;
        self.transition(CentralConnectionState::Idle);
    }
}

async fn find_service<T: CentralTransport + ?Sized>(
    transport: &T,
    uuid: Uuid,
) -> Option<ServiceHandle> {
    match transport.discover_service(uuid).await {
        Ok(service) => service,
        Err(e) => {
            warn!("Service {} lookup failed: {}", uuid, e);
            None
        }
    }
}

async fn find_characteristic<T: CentralTransport + ?Sized>(
    transport: &T,
    service: &ServiceHandle,
    role: BikeCharacteristic,
) -> Option<CharacteristicHandle> {
    match transport.get_characteristic(service, role.uuid()).await {
        Ok(Some(characteristic)) => {
            info!("Found {}", role);
            Some(characteristic)
        }
        Ok(None) => {
            info!("{} not found", role);
            None
        }
        Err(e) => {
            warn!("{} lookup failed: {}", role, e);
            None
        }
    }
}

async fn try_subscribe<T: CentralTransport + ?Sized>(
    transport: &T,
    characteristic: &CharacteristicHandle,
    role: BikeCharacteristic,
) -> bool {
    if !characteristic.properties.notify {
        warn!("{} cannot notify", role);
        return false;
    }

    match transport.subscribe(characteristic).await {
        Ok(()) => {
            info!("Subscribed to {}", role);
            true
        }
        Err(e) => {
            warn!("Failed to subscribe to {}: {}", role, e);
            false
        }
    }
}

/// Locate the bike's characteristics, subscribe, and read its features.
///
/// Only the vendor data characteristic (0xFFF1) is required; every other
/// failure is logged and leaves the matching slot empty.
pub async fn discover_bike<T: CentralTransport + ?Sized>(transport: &T) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    if let Some(ftms) = find_service(transport, FTMS_SERVICE_UUID).await {
        info!("Found bike FTMS service");

        if let Some(feature) =
            find_characteristic(transport, &ftms, BikeCharacteristic::FtmsFeature).await
        {
            report.feature_subscribed =
                try_subscribe(transport, &feature, BikeCharacteristic::FtmsFeature).await;
            report.characteristics.ftms_feature = Some(feature);
        }

        if let Some(control_point) =
            find_characteristic(transport, &ftms, BikeCharacteristic::ControlPoint).await
        {
            info!(
                "Bike control point writable: {}, indicable: {}",
                control_point.properties.write, control_point.properties.indicate
            );
            report.characteristics.control_point = Some(control_point);
        }

        if let Some(data) =
            find_characteristic(transport, &ftms, BikeCharacteristic::FtmsData).await
        {
            if data.properties.read {
                match transport.read_value(&data).await {
                    Ok(value) if !value.is_empty() => {
                        debug!("Bike 0x2ACC raw: {:02X?}", value);
                        report.features = decode_bike_features(&value);
                        if let Some(features) = report.features {
                            info!(
                                "Bike machine features 0x{:08X}, target setting features 0x{:08X}",
                                features.machine_features, features.target_setting_features
                            );
                        }
                    }
                    Ok(_) => debug!("Bike 0x2ACC read returned no data"),
                    Err(e) => warn!("Failed to read bike 0x2ACC: {}", e),
                }
            }
            report.characteristics.ftms_data = Some(data);
        }
    } else {
        info!("Bike FTMS service not found");
    }

    if let Some(custom) = find_service(transport, BIKE_CUSTOM_SERVICE_UUID).await {
        info!("Found bike vendor service");
        if let Some(data) =
            find_characteristic(transport, &custom, BikeCharacteristic::CustomData).await
        {
            report.primary_subscribed =
                try_subscribe(transport, &data, BikeCharacteristic::CustomData).await;
            report.characteristics.custom_data = Some(data);
        }
    } else {
        warn!("Bike vendor service (0xFFF0) not found");
    }

    if !report.primary_subscribed {
        warn!("Failed to establish the primary data path (0xFFF1 notifications)");
    }

    report
}

/// Send the two-step init sequence to the bike's control point.
///
/// Best effort: a control point that is not writable is skipped, and write
/// failures are logged.
pub async fn send_init_sequence<T: CentralTransport + ?Sized>(
    transport: &T,
    control_point: &CharacteristicHandle,
    settle: Duration,
) {
    if !control_point.properties.write {
        warn!("Bike control point is not writable, skipping init sequence");
        return;
    }

    for (i, command) in BIKE_INIT_SEQUENCE.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(settle).await;
        }

        match transport.write_value(control_point, &[*command], true).await {
            Ok(()) => info!("Sent control command 0x{:02X} to bike", command),
            Err(e) => warn!("Failed to send control command 0x{:02X} to bike: {}", command, e),
        }
    }
}
