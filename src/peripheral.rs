use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::Result,
    protocol::{
        encode_indoor_bike_data, encode_service_changed, encode_supported_power_range,
        encode_supported_resistance_range, encode_unsupported_range, MACHINE_STATUS_STOPPED,
        SERVICE_CHANGED_RANGE, TRAINING_STATUS_MANUAL_MODE,
    },
    types::{
        AppCharacteristic, BridgeConfig, CharacteristicProperties, PeripheralConnectionState,
        SensorState, StatusUpdate, Subscription,
    },
    DEVICE_INFORMATION_SERVICE_UUID, FIRMWARE_REVISION_UUID, FTMS_SERVICE_UUID,
    FTMS_SUPPORTED_HEART_RATE_RANGE_UUID, FTMS_SUPPORTED_INCLINATION_RANGE_UUID,
    FTMS_SUPPORTED_POWER_RANGE_UUID, FTMS_SUPPORTED_RESISTANCE_RANGE_UUID,
    FTMS_SUPPORTED_SPEED_RANGE_UUID, GAP_APPEARANCE_UUID, GAP_DEVICE_NAME_UUID, GAP_SERVICE_UUID,
    GATT_SERVICE_UUID, MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID, SYSTEM_ID_UUID,
};

/// App-facing GATT server operations.
///
/// Implementations serve a [`GattProfile`] and report connections, CCCD
/// writes and control point writes as [`AppEvent`](crate::types::AppEvent)s on
/// the bridge's event channel.
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Start advertising the bridge
    async fn start_advertising(&self) -> Result<()>;

    /// Whether advertising is running
    async fn is_advertising(&self) -> bool;

    /// Set the value and notify subscribers
    async fn notify(&self, characteristic: AppCharacteristic, value: &[u8]) -> Result<()>;

    /// Set the value and indicate subscribers
    async fn indicate(&self, characteristic: AppCharacteristic, value: &[u8]) -> Result<()>;

    /// Number of peers subscribed to a characteristic
    async fn subscriber_count(&self, characteristic: AppCharacteristic) -> usize;
}

/// Immediate reaction to a CCCD write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeAction {
    /// Push the current status value to the new subscriber
    SyncStatus(StatusUpdate),
    /// Indicate Service Changed
    IndicateServiceChanged,
}

/// App-facing connection state and per-characteristic bookkeeping
#[derive(Debug)]
pub struct PeripheralLifecycle {
    state: PeripheralConnectionState,
    peer: Option<String>,
    subscriptions: HashMap<AppCharacteristic, Subscription>,
    training_status: u8,
    machine_status: u8,
    last_sent: HashMap<AppCharacteristic, u8>,
}

impl Default for PeripheralLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl PeripheralLifecycle {
    /// Start in `Advertising` with the initial status values
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: PeripheralConnectionState::Advertising,
            peer: None,
            subscriptions: HashMap::new(),
            training_status: TRAINING_STATUS_MANUAL_MODE,
            machine_status: MACHINE_STATUS_STOPPED,
            last_sent: HashMap::new(),
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> PeripheralConnectionState {
        self.state
    }

    /// Address of the connected app
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Whether an app is connected
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, PeripheralConnectionState::AppConnected)
    }

    /// Last CCCD value the app wrote for a characteristic
    #[must_use]
    pub fn subscription(&self, characteristic: AppCharacteristic) -> Subscription {
        self.subscriptions
            .get(&characteristic)
            .copied()
            .unwrap_or(Subscription::Disabled)
    }

    /// Whether the app enabled notifications or indications
    #[must_use]
    pub fn is_subscribed(&self, characteristic: AppCharacteristic) -> bool {
        self.subscription(characteristic).is_enabled()
    }

    /// Current value of a status characteristic
    #[must_use]
    pub const fn status_value(&self, characteristic: AppCharacteristic) -> Option<u8> {
        match characteristic {
            AppCharacteristic::TrainingStatus => Some(self.training_status),
            AppCharacteristic::FitnessMachineStatus => Some(self.machine_status),
            _ => None,
        }
    }

    /// Last value actually sent on a status characteristic
    #[must_use]
    pub fn last_sent(&self, characteristic: AppCharacteristic) -> Option<u8> {
        self.last_sent.get(&characteristic).copied()
    }

    /// App connected
    pub fn on_connected(&mut self, peer: String) {
        info!("App connected: {}", peer);
        self.peer = Some(peer);
        self.state = PeripheralConnectionState::AppConnected;
    }

    /// App disconnected; subscriptions and sent-value history are dropped
    pub fn on_disconnected(&mut self) {
        info!(
            "App disconnected: {}",
            self.peer.as_deref().unwrap_or("unknown peer")
        );
        self.peer = None;
        self.state = PeripheralConnectionState::Advertising;
        self.subscriptions.clear();
        self.last_sent.clear();
    }

    /// Record a CCCD write and say what to send right away
    pub fn on_subscribe(
        &mut self,
        characteristic: AppCharacteristic,
        cccd: u16,
    ) -> Option<SubscribeAction> {
        let subscription = Subscription::from(cccd);
        info!(
            "App {} for {} (CCCD 0x{:04X})",
            subscription, characteristic, cccd
        );
        self.subscriptions.insert(characteristic, subscription);

        match (characteristic, subscription) {
            (
                AppCharacteristic::TrainingStatus | AppCharacteristic::FitnessMachineStatus,
                Subscription::Notifications,
            ) => self.status_value(characteristic).map(|value| {
                SubscribeAction::SyncStatus(StatusUpdate {
                    characteristic,
                    value,
                    force: true,
                })
            }),
            (AppCharacteristic::ServiceChanged, Subscription::Indications) => {
                Some(SubscribeAction::IndicateServiceChanged)
            }
            _ => None,
        }
    }

    /// Record a new status value and decide whether it goes out.
    ///
    /// Nothing changes while no app is connected. Otherwise the value becomes
    /// current, and it is sent when there is a subscriber and it differs from
    /// the last value sent (or the update is forced).
    pub fn prepare_status(&mut self, update: &StatusUpdate, subscribers: usize) -> bool {
        if !self.is_connected() {
            return false;
        }

        match update.characteristic {
            AppCharacteristic::TrainingStatus => self.training_status = update.value,
            AppCharacteristic::FitnessMachineStatus => self.machine_status = update.value,
            other => {
                warn!("{} is not a status characteristic", other);
                return false;
            }
        }

        subscribers > 0
            && (update.force || self.last_sent(update.characteristic) != Some(update.value))
    }

    /// Remember a status value that went out
    pub fn record_sent(&mut self, characteristic: AppCharacteristic, value: u8) {
        self.last_sent.insert(characteristic, value);
    }
}

/// Send a status update, honoring connection, subscribers and dedup.
///
/// Returns whether a notification went out.
///
/// # Errors
///
/// Returns the transport's error if the notify fails.
pub async fn send_status<P: PeripheralTransport + ?Sized>(
    transport: &P,
    lifecycle: &mut PeripheralLifecycle,
    update: StatusUpdate,
) -> Result<bool> {
    let subscribers = transport.subscriber_count(update.characteristic).await;
    if !lifecycle.prepare_status(&update, subscribers) {
        debug!(
            "Skipping {} 0x{:02X} (subscribers {}, last sent {:?})",
            update.characteristic,
            update.value,
            subscribers,
            lifecycle.last_sent(update.characteristic)
        );
        return Ok(false);
    }

    transport
        .notify(update.characteristic, &[update.value])
        .await?;
    lifecycle.record_sent(update.characteristic, update.value);
    info!("Sent {} 0x{:02X}", update.characteristic, update.value);
    Ok(true)
}

/// Notify a characteristic when an app is connected and subscribed.
///
/// Returns whether the notification went out.
///
/// # Errors
///
/// Returns the transport's error if the notify fails.
pub async fn notify_subscribers<P: PeripheralTransport + ?Sized>(
    transport: &P,
    lifecycle: &PeripheralLifecycle,
    characteristic: AppCharacteristic,
    value: &[u8],
) -> Result<bool> {
    if !lifecycle.is_connected() || transport.subscriber_count(characteristic).await == 0 {
        return Ok(false);
    }

    transport.notify(characteristic, value).await?;
    Ok(true)
}

/// Indicate Service Changed over the whole handle range
///
/// # Errors
///
/// Returns the transport's error if the indication fails.
pub async fn indicate_service_changed<P: PeripheralTransport + ?Sized>(
    transport: &P,
    lifecycle: &PeripheralLifecycle,
) -> Result<bool> {
    if !lifecycle.is_connected()
        || transport
            .subscriber_count(AppCharacteristic::ServiceChanged)
            .await
            == 0
    {
        return Ok(false);
    }

    transport
        .indicate(
            AppCharacteristic::ServiceChanged,
            &encode_service_changed(),
        )
        .await?;
    info!(
        "Indicated Service Changed, range 0x{:04X}-0x{:04X}",
        SERVICE_CHANGED_RANGE.0, SERVICE_CHANGED_RANGE.1
    );
    Ok(true)
}

/// Restart advertising unless it is already running
///
/// # Errors
///
/// Returns the transport's error if advertising cannot start.
pub async fn ensure_advertising<P: PeripheralTransport + ?Sized>(transport: &P) -> Result<bool> {
    if transport.is_advertising().await {
        return Ok(false);
    }

    transport.start_advertising().await?;
    info!("Advertising restarted");
    Ok(true)
}

/// Advertisement payload for the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Complete local name
    pub local_name: String,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
    /// GAP appearance
    pub appearance: u16,
    /// AD flags: LE general discoverable, BR/EDR not supported
    pub flags: u8,
    /// Preferred minimum connection interval, 1.25 ms units
    pub min_interval: u16,
    /// Preferred maximum connection interval, 1.25 ms units
    pub max_interval: u16,
}

/// One characteristic of the bridge's GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Supported operations
    pub properties: CharacteristicProperties,
    /// Initial value
    pub value: Vec<u8>,
    /// Dynamic role, `None` for static read-only values
    pub role: Option<AppCharacteristic>,
}

/// One service of the bridge's GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics in declaration order
    pub characteristics: Vec<GattCharacteristic>,
}

/// Everything a GATT server needs to impersonate an FTMS indoor bike
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    /// Advertisement payload
    pub advertisement: Advertisement,
    /// Services in declaration order
    pub services: Vec<GattService>,
}

const READ: CharacteristicProperties = CharacteristicProperties {
    read: true,
    write: false,
    write_without_response: false,
    notify: false,
    indicate: false,
};

const NOTIFY: CharacteristicProperties = CharacteristicProperties {
    read: false,
    write: false,
    write_without_response: false,
    notify: true,
    indicate: false,
};

fn fixed(uuid: Uuid, value: impl Into<Vec<u8>>) -> GattCharacteristic {
    GattCharacteristic {
        uuid,
        properties: READ,
        value: value.into(),
        role: None,
    }
}

fn dynamic(
    role: AppCharacteristic,
    properties: CharacteristicProperties,
    value: Vec<u8>,
) -> GattCharacteristic {
    GattCharacteristic {
        uuid: role.uuid(),
        properties,
        value,
        role: Some(role),
    }
}

impl GattProfile {
    /// Build the profile for a configuration
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        let info = &config.device_information;

        let ftms = GattService {
            uuid: FTMS_SERVICE_UUID,
            characteristics: vec![
                dynamic(AppCharacteristic::FtmsFeatureRelay, NOTIFY, Vec::new()),
                dynamic(
                    AppCharacteristic::IndoorBikeData,
                    CharacteristicProperties {
                        read: true,
                        ..NOTIFY
                    },
                    encode_indoor_bike_data(&SensorState::default()).to_vec(),
                ),
                dynamic(
                    AppCharacteristic::TrainingStatus,
                    CharacteristicProperties {
                        read: true,
                        ..NOTIFY
                    },
                    vec![TRAINING_STATUS_MANUAL_MODE],
                ),
                fixed(FTMS_SUPPORTED_SPEED_RANGE_UUID, encode_unsupported_range()),
                fixed(
                    FTMS_SUPPORTED_INCLINATION_RANGE_UUID,
                    encode_unsupported_range(),
                ),
                fixed(
                    FTMS_SUPPORTED_RESISTANCE_RANGE_UUID,
                    encode_supported_resistance_range().to_vec(),
                ),
                fixed(
                    FTMS_SUPPORTED_POWER_RANGE_UUID,
                    encode_supported_power_range().to_vec(),
                ),
                fixed(
                    FTMS_SUPPORTED_HEART_RATE_RANGE_UUID,
                    encode_unsupported_range(),
                ),
                dynamic(
                    AppCharacteristic::ControlPoint,
                    CharacteristicProperties {
                        write: true,
                        indicate: true,
                        ..CharacteristicProperties::default()
                    },
                    Vec::new(),
                ),
                dynamic(
                    AppCharacteristic::FitnessMachineStatus,
                    NOTIFY,
                    vec![MACHINE_STATUS_STOPPED],
                ),
            ],
        };

        let device_information = GattService {
            uuid: DEVICE_INFORMATION_SERVICE_UUID,
            characteristics: vec![
                fixed(MANUFACTURER_NAME_UUID, info.manufacturer_name.as_bytes()),
                fixed(MODEL_NUMBER_UUID, info.model_number.as_bytes()),
                fixed(FIRMWARE_REVISION_UUID, info.firmware_revision.as_bytes()),
                fixed(SYSTEM_ID_UUID, info.system_id),
            ],
        };

        let generic_access = GattService {
            uuid: GAP_SERVICE_UUID,
            characteristics: vec![
                GattCharacteristic {
                    uuid: GAP_DEVICE_NAME_UUID,
                    properties: CharacteristicProperties {
                        write: true,
                        ..READ
                    },
                    value: config.device_name.as_bytes().to_vec(),
                    role: None,
                },
                fixed(GAP_APPEARANCE_UUID, info.appearance.to_le_bytes()),
            ],
        };

        let generic_attribute = GattService {
            uuid: GATT_SERVICE_UUID,
            characteristics: vec![dynamic(
                AppCharacteristic::ServiceChanged,
                CharacteristicProperties {
                    indicate: true,
                    ..CharacteristicProperties::default()
                },
                Vec::new(),
            )],
        };

        Self {
            advertisement: Advertisement {
                local_name: config.device_name.clone(),
                service_uuids: vec![FTMS_SERVICE_UUID],
                appearance: info.appearance,
                flags: 0x06,
                min_interval: 0x06,
                max_interval: 0x12,
            },
            services: vec![ftms, device_information, generic_access, generic_attribute],
        }
    }

    /// Find a characteristic by UUID
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| characteristic.uuid == uuid)
    }

    /// Map a server characteristic UUID to its dynamic role
    #[must_use]
    pub fn role_of(&self, uuid: Uuid) -> Option<AppCharacteristic> {
        self.characteristic(uuid).and_then(|c| c.role)
    }
}
