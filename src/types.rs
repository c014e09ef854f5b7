use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{
    BIKE_CUSTOM_DATA_CHAR_UUID, BIKE_CUSTOM_SERVICE_UUID, FTMS_CONTROL_POINT_UUID,
    FTMS_FEATURE_UUID, FTMS_INDOOR_BIKE_DATA_UUID, FTMS_SERVICE_UUID, FTMS_STATUS_UUID,
    FTMS_TRAINING_STATUS_UUID, SERVICE_CHANGED_UUID,
};

/// Lowest resistance level the bike reports or accepts
pub const MIN_RESISTANCE_LEVEL: u8 = 1;

/// Highest resistance level the bike reports or accepts
pub const MAX_RESISTANCE_LEVEL: u8 = 8;

/// Live readings decoded from the bike
///
/// Units follow the FTMS Indoor Bike Data conventions so the encode path can
/// copy fields verbatim:
/// - `speed`: 0.01 km/h
/// - `cadence`: 0.5 RPM (raw RPM x2)
/// - `power`: watts, signed
/// - `calories_x10`: tenths of a kilocalorie
/// - `apparent_resistance`: 0 when unknown, otherwise 1-8
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorState {
    /// Instantaneous speed in 0.01 km/h
    pub speed: u16,
    /// Instantaneous cadence in 0.5 RPM
    pub cadence: u16,
    /// Instantaneous power in watts
    pub power: i16,
    /// Total energy in 0.1 kcal
    pub calories_x10: u16,
    /// Resistance inferred from bike telemetry
    pub apparent_resistance: u8,
}

impl SensorState {
    /// Apply a decoded bike frame
    pub fn apply(&mut self, delta: SensorDelta) {
        match delta {
            SensorDelta::SpeedCadencePower {
                speed,
                cadence,
                power,
            } => {
                self.speed = speed;
                self.cadence = cadence;
                self.power = power;
            }
            SensorDelta::Calories { calories_x10 } => self.calories_x10 = calories_x10,
        }
    }

    /// Record a resistance level reported by the bike.
    ///
    /// Levels outside 1-8 are rejected and the previous value is kept.
    /// Returns whether the level was accepted.
    pub fn set_apparent_resistance(&mut self, level: u8) -> bool {
        if (MIN_RESISTANCE_LEVEL..=MAX_RESISTANCE_LEVEL).contains(&level) {
            self.apparent_resistance = level;
            true
        } else {
            false
        }
    }

    /// Zero every reading
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Field update produced by decoding one proprietary bike frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorDelta {
    /// Sub-type 0x42 frame
    SpeedCadencePower {
        /// Speed in 0.01 km/h
        speed: u16,
        /// Cadence in 0.5 RPM
        cadence: u16,
        /// Power in watts
        power: i16,
    },
    /// Sub-type 0x43 frame
    Calories {
        /// Total energy in 0.1 kcal
        calories_x10: u16,
    },
}

/// Target settings requested by the app over the control point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSettings {
    /// Target inclination in 0.01 % (550 = 5.50 %)
    pub target_inclination_percent_x100: i16,
    /// Target resistance on the bike's 1-8 scale, 0 when unset
    pub target_resistance_level: u8,
}

impl TargetSettings {
    /// Clear both targets
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Feature bitfields read from the bike's 0x2ACC characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BikeFeatures {
    /// Fitness machine features field
    pub machine_features: u32,
    /// Target setting features field
    pub target_setting_features: u32,
}

/// Central (bike-facing) connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CentralConnectionState {
    /// Nothing in progress; waiting for a scan request
    Idle,
    /// Radio scan running
    Scanning,
    /// The configured bike was seen and scanning stopped
    TargetFound,
    /// A connect attempt is in flight
    Connecting,
    /// Link up, discovery pending
    Connected,
    /// Characteristics located, primary subscription pending
    ServicesDiscovered,
    /// Primary data path subscribed
    Ready,
    /// Local disconnect issued
    Disconnecting,
}

impl fmt::Display for CentralConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::TargetFound => write!(f, "Target Found"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::ServicesDiscovered => write!(f, "Services Discovered"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Peripheral (app-facing) connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeripheralConnectionState {
    /// No app connected
    Advertising,
    /// An app is connected
    AppConnected,
}

impl fmt::Display for PeripheralConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advertising => write!(f, "Advertising"),
            Self::AppConnected => write!(f, "App Connected"),
        }
    }
}

/// Characteristics the bridge serves to the app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppCharacteristic {
    /// Encoded Indoor Bike Data frames
    IndoorBikeData,
    /// Training Status
    TrainingStatus,
    /// Fitness Machine Status
    FitnessMachineStatus,
    /// Verbatim relay of the bike's 0x2AD2 notifications
    FtmsFeatureRelay,
    /// GATT Service Changed
    ServiceChanged,
    /// Fitness Machine Control Point
    ControlPoint,
}

impl AppCharacteristic {
    /// Characteristic UUID as exposed on the bridge's GATT server
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::IndoorBikeData => FTMS_INDOOR_BIKE_DATA_UUID,
            Self::TrainingStatus => FTMS_TRAINING_STATUS_UUID,
            Self::FitnessMachineStatus => FTMS_STATUS_UUID,
            Self::FtmsFeatureRelay => FTMS_FEATURE_UUID,
            Self::ServiceChanged => SERVICE_CHANGED_UUID,
            Self::ControlPoint => FTMS_CONTROL_POINT_UUID,
        }
    }
}

impl fmt::Display for AppCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndoorBikeData => write!(f, "Indoor Bike Data"),
            Self::TrainingStatus => write!(f, "Training Status"),
            Self::FitnessMachineStatus => write!(f, "Fitness Machine Status"),
            Self::FtmsFeatureRelay => write!(f, "FTMS Feature"),
            Self::ServiceChanged => write!(f, "Service Changed"),
            Self::ControlPoint => write!(f, "Control Point"),
        }
    }
}

/// Characteristics the bridge consumes from the bike
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BikeCharacteristic {
    /// Bike's 0x2ACC; carries feature bitfields on this bike
    FtmsData,
    /// Bike's FTMS control point (0x2AD9)
    ControlPoint,
    /// Bike's 0x2AD2; notifies FTMS-like resistance frames
    FtmsFeature,
    /// Proprietary data characteristic (0xFFF1), the primary data path
    CustomData,
}

impl BikeCharacteristic {
    /// All roles, in discovery order
    pub const ALL: [Self; 4] = [
        Self::FtmsFeature,
        Self::ControlPoint,
        Self::FtmsData,
        Self::CustomData,
    ];

    /// Characteristic UUID on the bike
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::FtmsData => FTMS_INDOOR_BIKE_DATA_UUID,
            Self::ControlPoint => FTMS_CONTROL_POINT_UUID,
            Self::FtmsFeature => FTMS_FEATURE_UUID,
            Self::CustomData => BIKE_CUSTOM_DATA_CHAR_UUID,
        }
    }

    /// Service the characteristic lives in
    #[must_use]
    pub const fn service_uuid(self) -> Uuid {
        match self {
            Self::CustomData => BIKE_CUSTOM_SERVICE_UUID,
            Self::FtmsData | Self::ControlPoint | Self::FtmsFeature => FTMS_SERVICE_UUID,
        }
    }

    /// Map a notifying characteristic UUID back to its role
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }
}

impl fmt::Display for BikeCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FtmsData => write!(f, "Bike FTMS Data (0x2ACC)"),
            Self::ControlPoint => write!(f, "Bike Control Point (0x2AD9)"),
            Self::FtmsFeature => write!(f, "Bike FTMS Feature (0x2AD2)"),
            Self::CustomData => write!(f, "Bike Custom Data (0xFFF1)"),
        }
    }
}

/// CCCD value written by the app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// 0x0000
    Disabled,
    /// 0x0001
    Notifications,
    /// 0x0002
    Indications,
    /// Anything else
    Unknown(u16),
}

impl From<u16> for Subscription {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => Self::Disabled,
            0x0001 => Self::Notifications,
            0x0002 => Self::Indications,
            other => Self::Unknown(other),
        }
    }
}

impl Subscription {
    /// Whether the peer wants updates of any kind
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Notifications | Self::Indications)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Notifications => write!(f, "notifications enabled"),
            Self::Indications => write!(f, "indications enabled"),
            Self::Unknown(raw) => write!(f, "unknown CCCD value 0x{raw:04X}"),
        }
    }
}

/// Decoded control point request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    /// Request opcode
    pub opcode: u8,
    /// Bytes following the opcode
    pub params: Vec<u8>,
}

impl ControlCommand {
    /// Split a raw control point write; `None` for an empty write
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (&opcode, params) = data.split_first()?;
        Some(Self {
            opcode,
            params: params.to_vec(),
        })
    }
}

/// Control point result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResultCode {
    /// Request handled
    Success = 0x01,
    /// Opcode not in the dispatch table
    OpCodeNotSupported = 0x02,
    /// Request too short for its opcode
    InvalidParameter = 0x04,
}

/// Control point response, indicated back to the app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    /// Opcode being answered
    pub request_opcode: u8,
    /// Outcome
    pub result: ResultCode,
}

/// Status characteristic update scheduled after a control point response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    /// `TrainingStatus` or `FitnessMachineStatus`
    pub characteristic: AppCharacteristic,
    /// New single-byte status value
    pub value: u8,
    /// Send even when the value equals the last one sent
    pub force: bool,
}

/// Device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Bluetooth address, `XX:XX:XX:XX:XX:XX`
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength
    pub rssi: Option<i16>,
}

/// Remote service located by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Service UUID
    pub uuid: Uuid,
}

/// GATT properties of a remote characteristic
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    /// Readable
    pub read: bool,
    /// Writable with response
    pub write: bool,
    /// Writable without response
    pub write_without_response: bool,
    /// Can notify
    pub notify: bool,
    /// Can indicate
    pub indicate: bool,
}

/// Remote characteristic located by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Owning service
    pub service_uuid: Uuid,
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Supported operations
    pub properties: CharacteristicProperties,
}

/// References to the four bike characteristics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BikeCharacteristics {
    /// Bike's 0x2ACC
    pub ftms_data: Option<CharacteristicHandle>,
    /// Bike's 0x2AD9
    pub control_point: Option<CharacteristicHandle>,
    /// Bike's 0x2AD2
    pub ftms_feature: Option<CharacteristicHandle>,
    /// Bike's 0xFFF1
    pub custom_data: Option<CharacteristicHandle>,
}

impl BikeCharacteristics {
    /// Look up a reference by role
    #[must_use]
    pub const fn get(&self, role: BikeCharacteristic) -> Option<&CharacteristicHandle> {
        match role {
            BikeCharacteristic::FtmsData => self.ftms_data.as_ref(),
            BikeCharacteristic::ControlPoint => self.control_point.as_ref(),
            BikeCharacteristic::FtmsFeature => self.ftms_feature.as_ref(),
            BikeCharacteristic::CustomData => self.custom_data.as_ref(),
        }
    }

    /// Whether no reference is held
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ftms_data.is_none()
            && self.control_point.is_none()
            && self.ftms_feature.is_none()
            && self.custom_data.is_none()
    }
}

/// Result of the discovery-and-subscribe procedure run after connecting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Characteristics that were found
    pub characteristics: BikeCharacteristics,
    /// Primary data path (0xFFF1) subscription succeeded
    pub primary_subscribed: bool,
    /// Secondary 0x2AD2 subscription succeeded
    pub feature_subscribed: bool,
    /// Feature bitfields read from 0x2ACC, if readable
    pub features: Option<BikeFeatures>,
}

/// Events delivered to the bike-facing state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BikeEvent {
    /// Host asked for a scan
    ScanRequested,
    /// Transport reported an advertisement
    DeviceDiscovered(DiscoveredDevice),
    /// Host (or auto-connect) asked to connect to the found target
    ConnectRequested,
    /// Transport connect succeeded
    Connected,
    /// Transport connect failed
    ConnectFailed(String),
    /// Discovery procedure completed
    DiscoveryFinished(DiscoveryReport),
    /// Link dropped, remote or local
    Disconnected,
    /// Notification from a subscribed bike characteristic
    Notification {
        /// Notifying characteristic UUID
        characteristic: Uuid,
        /// Raw payload
        value: Vec<u8>,
    },
}

/// Events delivered to the app-facing state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// App connected to the bridge's GATT server
    Connected {
        /// Peer address as reported by the transport
        peer: String,
    },
    /// App disconnected
    Disconnected,
    /// App wrote a CCCD
    Subscribed {
        /// Characteristic whose CCCD changed
        characteristic: AppCharacteristic,
        /// Raw CCCD value
        cccd: u16,
    },
    /// App wrote the control point
    ControlPointWritten(Vec<u8>),
}

/// Any event the bridge consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Bike side
    Bike(BikeEvent),
    /// App side
    App(AppEvent),
}

impl From<BikeEvent> for BridgeEvent {
    fn from(event: BikeEvent) -> Self {
        Self::Bike(event)
    }
}

impl From<AppEvent> for BridgeEvent {
    fn from(event: AppEvent) -> Self {
        Self::App(event)
    }
}

/// Device Information values served to the app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInformation {
    /// Manufacturer Name String (0x2A29)
    pub manufacturer_name: String,
    /// Model Number String (0x2A24)
    pub model_number: String,
    /// Firmware Revision String (0x2A26)
    pub firmware_revision: String,
    /// System ID (0x2A23)
    pub system_id: [u8; 8],
    /// GAP appearance
    pub appearance: u16,
}

impl Default for DeviceInformation {
    fn default() -> Self {
        Self {
            manufacturer_name: "DIY Project: FTMS Bridge".to_string(),
            model_number: "FTMS-S26-Bridge".to_string(),
            firmware_revision: crate::VERSION.to_string(),
            system_id: [0x49, 0xB6, 0xE2, 0x3C, 0x01, 0xAB, 0x00, 0x00],
            appearance: 0x0741,
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address of the bike to connect to
    pub bike_address: String,
    /// Name advertised to the app
    pub device_name: String,
    /// Connect as soon as the bike is found
    pub auto_connect: bool,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Wait after connecting before discovery, in milliseconds
    pub connect_settle_ms: u64,
    /// Wait between the two bike init writes, in milliseconds
    pub control_settle_ms: u64,
    /// Indoor Bike Data publish period in milliseconds
    pub data_interval_ms: u64,
    /// Device Information values
    pub device_information: DeviceInformation,
}

impl BridgeConfig {
    /// Whether an advertised address is the configured bike
    #[must_use]
    pub fn matches_bike(&self, address: &str) -> bool {
        self.bike_address.eq_ignore_ascii_case(address.trim())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bike_address: "24:00:0C:A0:4B:4B".to_string(),
            device_name: "FTMS Bridge".to_string(),
            auto_connect: true,
            connect_timeout_ms: 10_000,
            connect_settle_ms: 100,
            control_settle_ms: 250,
            data_interval_ms: 1_000,
            device_information: DeviceInformation::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_state_apply() {
        let mut state = SensorState::default();
        state.apply(SensorDelta::SpeedCadencePower {
            speed: 2_550,
            cadence: 180,
            power: 101,
        });
        state.apply(SensorDelta::Calories { calories_x10: 300 });

        assert_eq!(state.speed, 2_550);
        assert_eq!(state.cadence, 180);
        assert_eq!(state.power, 101);
        assert_eq!(state.calories_x10, 300);
        assert_eq!(state.apparent_resistance, 0);
    }

    #[test]
    fn test_apparent_resistance_rejects_out_of_range() {
        let mut state = SensorState::default();
        assert!(state.set_apparent_resistance(5));
        assert!(!state.set_apparent_resistance(9));
        assert!(!state.set_apparent_resistance(0));
        assert_eq!(state.apparent_resistance, 5);

        state.reset();
        assert_eq!(state, SensorState::default());
    }

    #[test]
    fn test_subscription_from_cccd() {
        assert_eq!(Subscription::from(0x0000), Subscription::Disabled);
        assert_eq!(Subscription::from(0x0001), Subscription::Notifications);
        assert_eq!(Subscription::from(0x0002), Subscription::Indications);
        assert_eq!(Subscription::from(0x0003), Subscription::Unknown(3));
        assert!(!Subscription::Unknown(3).is_enabled());
        assert!(Subscription::Indications.is_enabled());
    }

    #[test]
    fn test_bike_characteristic_lookup() {
        for role in BikeCharacteristic::ALL {
            assert_eq!(BikeCharacteristic::from_uuid(role.uuid()), Some(role));
        }
        assert_eq!(BikeCharacteristic::from_uuid(SERVICE_CHANGED_UUID), None);
        assert_eq!(
            BikeCharacteristic::CustomData.service_uuid(),
            BIKE_CUSTOM_SERVICE_UUID
        );
    }

    #[test]
    fn test_control_command_split() {
        assert_eq!(ControlCommand::from_bytes(&[]), None);

        let command = ControlCommand::from_bytes(&[0x03, 0x26, 0x02]).unwrap();
        assert_eq!(command.opcode, 0x03);
        assert_eq!(command.params, vec![0x26, 0x02]);
    }

    #[test]
    fn test_bridge_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.bike_address, "24:00:0C:A0:4B:4B");
        assert!(config.auto_connect);
        assert_eq!(config.connect_settle_ms, 100);
        assert_eq!(config.control_settle_ms, 250);
        assert_eq!(config.data_interval_ms, 1_000);
        assert_eq!(config.device_information.appearance, 0x0741);

        assert!(config.matches_bike("24:00:0c:a0:4b:4b"));
        assert!(!config.matches_bike("24:00:0C:A0:4B:4C"));
    }
}
