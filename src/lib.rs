#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # FTMS Bridge 🚴
//!
//! A Rust library that turns a proprietary exercise bike into a standard
//! Bluetooth Fitness Machine Service (FTMS) indoor bike.
//!
//! The bike speaks its own dialect over BLE: live readings arrive on a vendor
//! service (0xFFF0/0xFFF1) and resistance changes on an FTMS-looking
//! characteristic whose frames do not follow the FTMS layout. Training apps
//! only understand FTMS. The bridge sits in the middle and plays both roles at
//! once:
//!
//! - **Central** to the bike: scan, connect, discover, subscribe, decode.
//! - **Peripheral** to the app: serve FTMS, encode Indoor Bike Data, answer the
//!   control point, keep the status characteristics in sync.
//!
//! ## Architecture
//!
//! - [`protocol`]: byte-exact codec for the bike frames and the FTMS frames
//! - [`control`]: opcode table for control point writes
//! - [`store`]: the single lock shared by every event source
//! - [`central`] / [`peripheral`]: the two connection state machines and the
//!   transport traits they drive
//! - [`ble`]: `btleplug` implementation of the bike-facing transport
//! - [`bridge`]: the context object tying it all together
//!
//! Transports report what happened by sending [`BridgeEvent`]s into the
//! bridge's channel; the bridge never blocks on a BLE operation inside its
//! event handler.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ftms_bridge::{BridgeConfig, BtleplugCentral, FtmsBridge, PeripheralTransport};
//! use tokio::sync::mpsc;
//!
//! async fn serve<P>(gatt_server: Arc<P>) -> ftms_bridge::Result<()>
//! where
//!     P: PeripheralTransport + 'static,
//! {
//!     let config = BridgeConfig::default();
//!     let (events_tx, events_rx) = mpsc::unbounded_channel();
//!
//!     // The bike side is driven through btleplug
//!     let bike = Arc::new(BtleplugCentral::new(&config, events_tx.clone()).await?);
//!
//!     // The app side is whatever GATT server the host provides
//!     let bridge = FtmsBridge::new(config, bike, gatt_server, events_tx);
//!
//!     bridge.start().await?;
//!     bridge.run(events_rx).await;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bike-facing BLE transport built on btleplug
pub mod ble;
/// Context object owning the store and both lifecycles
pub mod bridge;
/// Central (bike-facing) connection lifecycle
pub mod central;
/// Control point command processing
pub mod control;
/// Error types and handling
pub mod error;
/// Peripheral (app-facing) connection lifecycle
pub mod peripheral;
/// Bike and FTMS frame codec
pub mod protocol;
/// Shared sensor and target state
pub mod store;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod mock;

// Re-export the main types for convenient usage
pub use ble::BtleplugCentral;
pub use bridge::FtmsBridge;
pub use central::{CentralLifecycle, CentralTransport};
pub use control::{process_control_point, ControlOpcode, ControlOutcome};
pub use error::{BridgeError, Result};
pub use peripheral::{GattProfile, PeripheralLifecycle, PeripheralTransport};
pub use store::SensorStore;
pub use types::{
    AppCharacteristic, AppEvent, BikeCharacteristic, BikeEvent, BikeFeatures, BridgeConfig,
    BridgeEvent, CentralConnectionState, ControlResponse, DeviceInformation,
    PeripheralConnectionState, ResultCode, SensorState, Subscription, TargetSettings,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Expand a 16-bit SIG-assigned number into a full Bluetooth base UUID
const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

/// Fitness Machine Service (0x1826), on the bike and on the bridge
pub const FTMS_SERVICE_UUID: Uuid = sig_uuid(0x1826);

/// Indoor Bike Data (0x2ACC)
///
/// The bike publishes its feature bitfields here, and the bridge serves its
/// encoded Indoor Bike Data frames here. The bike's 0x2AD2 in turn carries
/// resistance frames, relayed verbatim to the app's 0x2AD2. Both sides keep
/// the bike's assignment so an app that learned the bike directly sees the
/// same layout through the bridge.
pub const FTMS_INDOOR_BIKE_DATA_UUID: Uuid = sig_uuid(0x2ACC);

/// Fitness Machine Feature (0x2AD2)
pub const FTMS_FEATURE_UUID: Uuid = sig_uuid(0x2AD2);

/// Training Status (0x2AD3)
pub const FTMS_TRAINING_STATUS_UUID: Uuid = sig_uuid(0x2AD3);

/// Supported Speed Range (0x2AD4)
pub const FTMS_SUPPORTED_SPEED_RANGE_UUID: Uuid = sig_uuid(0x2AD4);

/// Supported Inclination Range (0x2AD5)
pub const FTMS_SUPPORTED_INCLINATION_RANGE_UUID: Uuid = sig_uuid(0x2AD5);

/// Supported Resistance Level Range (0x2AD6)
pub const FTMS_SUPPORTED_RESISTANCE_RANGE_UUID: Uuid = sig_uuid(0x2AD6);

/// Supported Heart Rate Range (0x2AD7)
pub const FTMS_SUPPORTED_HEART_RATE_RANGE_UUID: Uuid = sig_uuid(0x2AD7);

/// Supported Power Range (0x2AD8)
pub const FTMS_SUPPORTED_POWER_RANGE_UUID: Uuid = sig_uuid(0x2AD8);

/// Fitness Machine Control Point (0x2AD9)
pub const FTMS_CONTROL_POINT_UUID: Uuid = sig_uuid(0x2AD9);

/// Fitness Machine Status (0x2ADA)
pub const FTMS_STATUS_UUID: Uuid = sig_uuid(0x2ADA);

/// Generic Access service (0x1800)
pub const GAP_SERVICE_UUID: Uuid = sig_uuid(0x1800);

/// Device Name (0x2A00)
pub const GAP_DEVICE_NAME_UUID: Uuid = sig_uuid(0x2A00);

/// Appearance (0x2A01)
pub const GAP_APPEARANCE_UUID: Uuid = sig_uuid(0x2A01);

/// Generic Attribute service (0x1801)
pub const GATT_SERVICE_UUID: Uuid = sig_uuid(0x1801);

/// Service Changed (0x2A05)
pub const SERVICE_CHANGED_UUID: Uuid = sig_uuid(0x2A05);

/// Device Information service (0x180A)
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid = sig_uuid(0x180A);

/// System ID (0x2A23)
pub const SYSTEM_ID_UUID: Uuid = sig_uuid(0x2A23);

/// Model Number String (0x2A24)
pub const MODEL_NUMBER_UUID: Uuid = sig_uuid(0x2A24);

/// Firmware Revision String (0x2A26)
pub const FIRMWARE_REVISION_UUID: Uuid = sig_uuid(0x2A26);

/// Manufacturer Name String (0x2A29)
pub const MANUFACTURER_NAME_UUID: Uuid = sig_uuid(0x2A29);

/// Bike vendor service (0xFFF0)
pub const BIKE_CUSTOM_SERVICE_UUID: Uuid = sig_uuid(0xFFF0);

/// Bike vendor data characteristic (0xFFF1), the primary data path
pub const BIKE_CUSTOM_DATA_CHAR_UUID: Uuid = sig_uuid(0xFFF1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuid_expansion() {
        assert_eq!(
            FTMS_SERVICE_UUID,
            Uuid::parse_str("00001826-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_eq!(
            BIKE_CUSTOM_DATA_CHAR_UUID,
            Uuid::parse_str("0000fff1-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }
}
