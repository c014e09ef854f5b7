use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    control::{process_control_point, ControlOutcome},
    protocol::encode_indoor_bike_data,
    types::{BikeFeatures, SensorDelta, SensorState, TargetSettings},
};

#[derive(Debug, Default)]
struct StoreState {
    sensor: SensorState,
    targets: TargetSettings,
    features: BikeFeatures,
}

/// Shared sensor and target state.
///
/// Every read and write goes through one mutex, so an encode never observes a
/// half-applied frame and a control write never races a reset. Cloning the
/// store clones the handle, not the data.
#[derive(Debug, Clone, Default)]
pub struct SensorStore {
    state: Arc<Mutex<StoreState>>,
}

impl SensorStore {
    /// Create a zeroed store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a decoded proprietary frame
    pub async fn apply_delta(&self, delta: SensorDelta) {
        let mut state = self.state.lock().await;
        state.sensor.apply(delta);
        debug!("Sensor state now {:?}", state.sensor);
    }

    /// Record the bike's apparent resistance; out-of-range levels are rejected
    pub async fn set_apparent_resistance(&self, level: u8) -> bool {
        self.state.lock().await.sensor.set_apparent_resistance(level)
    }

    /// Record the feature bitfields read from the bike
    pub async fn set_features(&self, features: BikeFeatures) {
        self.state.lock().await.features = features;
    }

    /// Zero the live readings and the bike features after a bike disconnect.
    ///
    /// Targets are left alone.
    pub async fn reset_sensor(&self) {
        let mut state = self.state.lock().await;
        state.sensor.reset();
        state.features = BikeFeatures::default();
    }

    /// Copy of the live readings
    pub async fn sensor(&self) -> SensorState {
        self.state.lock().await.sensor
    }

    /// Copy of the app's targets
    pub async fn targets(&self) -> TargetSettings {
        self.state.lock().await.targets
    }

    /// Copy of the bike features
    pub async fn features(&self) -> BikeFeatures {
        self.state.lock().await.features
    }

    /// Run a control point write against the targets under the lock
    pub async fn process_control(&self, data: &[u8]) -> Option<ControlOutcome> {
        let mut state = self.state.lock().await;
        process_control_point(data, &mut state.targets)
    }

    /// Encode Indoor Bike Data from the live readings under the lock
    pub async fn encode_indoor_bike_data(&self) -> Bytes {
        let state = self.state.lock().await;
        encode_indoor_bike_data(&state.sensor)
    }
}
