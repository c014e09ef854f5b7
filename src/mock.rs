//! Recording transports for tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::{
    central::CentralTransport,
    error::{BridgeError, Result},
    peripheral::PeripheralTransport,
    types::{
        AppCharacteristic, BikeCharacteristic, CharacteristicHandle, CharacteristicProperties,
        ServiceHandle,
    },
};

/// Feature bitfields the fake bike returns from 0x2ACC
pub const BIKE_FEATURES_VALUE: [u8; 8] = [0x02, 0x44, 0x00, 0x00, 0x04, 0x20, 0x00, 0x00];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCall {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    Subscribe(Uuid),
    Write {
        uuid: Uuid,
        value: Vec<u8>,
        with_response: bool,
    },
    Read(Uuid),
}

#[derive(Debug, Default)]
pub struct MockCentral {
    calls: Mutex<Vec<CentralCall>>,
    scanning: AtomicBool,
    fail_connect: AtomicBool,
    fail_writes: AtomicBool,
    services: Mutex<HashMap<Uuid, Vec<CharacteristicHandle>>>,
    failing_subscriptions: Mutex<HashSet<Uuid>>,
}

impl MockCentral {
    pub fn handle(role: BikeCharacteristic, write: bool, notify: bool) -> CharacteristicHandle {
        CharacteristicHandle {
            service_uuid: role.service_uuid(),
            uuid: role.uuid(),
            properties: CharacteristicProperties {
                read: role == BikeCharacteristic::FtmsData,
                write,
                write_without_response: false,
                notify,
                indicate: role == BikeCharacteristic::ControlPoint,
            },
        }
    }

    /// A bike exposing all four characteristics
    pub fn with_bike() -> Self {
        let mock = Self::default();
        {
            let mut services = mock.services.lock().unwrap();
            for role in BikeCharacteristic::ALL {
                let handle = match role {
                    BikeCharacteristic::ControlPoint => Self::handle(role, true, false),
                    _ => Self::handle(role, false, true),
                };
                services.entry(role.service_uuid()).or_default().push(handle);
            }
        }
        mock
    }

    pub fn remove_service(&self, uuid: Uuid) {
        self.services.lock().unwrap().remove(&uuid);
    }

    pub fn remove_characteristic(&self, role: BikeCharacteristic) {
        if let Some(characteristics) = self.services.lock().unwrap().get_mut(&role.service_uuid()) {
            characteristics.retain(|c| c.uuid != role.uuid());
        }
    }

    pub fn fail_subscription(&self, uuid: Uuid) {
        self.failing_subscriptions.lock().unwrap().insert(uuid);
    }

    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<CentralCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CentralCall::Subscribe(uuid) => Some(uuid),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CentralCall::Write { value, .. } => Some(value),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: CentralCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CentralTransport for MockCentral {
    async fn start_scan(&self) -> Result<()> {
        self.record(CentralCall::StartScan);
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(CentralCall::StopScan);
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn connect(&self, address: &str) -> Result<()> {
        self.record(CentralCall::Connect(address.to_string()));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionFailed("refused".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(CentralCall::Disconnect);
        Ok(())
    }

    async fn discover_service(&self, uuid: Uuid) -> Result<Option<ServiceHandle>> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .contains_key(&uuid)
            .then_some(ServiceHandle { uuid }))
    }

    async fn get_characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicHandle>> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(&service.uuid)
            .and_then(|characteristics| characteristics.iter().find(|c| c.uuid == uuid).cloned()))
    }

    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
        self.record(CentralCall::Subscribe(characteristic.uuid));
        if self
            .failing_subscriptions
            .lock()
            .unwrap()
            .contains(&characteristic.uuid)
        {
            return Err(BridgeError::SubscriptionFailed(characteristic.uuid.to_string()));
        }
        Ok(())
    }

    async fn write_value(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.record(CentralCall::Write {
            uuid: characteristic.uuid,
            value: value.to_vec(),
            with_response,
        });
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("write rejected".to_string()));
        }
        Ok(())
    }

    async fn read_value(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
        self.record(CentralCall::Read(characteristic.uuid));
        Ok(BIKE_FEATURES_VALUE.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    StartAdvertising,
    Notify(AppCharacteristic, Vec<u8>),
    Indicate(AppCharacteristic, Vec<u8>),
}

#[derive(Debug, Default)]
pub struct MockPeripheral {
    calls: Mutex<Vec<PeripheralCall>>,
    advertising: AtomicBool,
    subscribers: Mutex<HashMap<AppCharacteristic, usize>>,
}

impl MockPeripheral {
    /// A server with one subscriber on every characteristic
    pub fn subscribed() -> Self {
        let mock = Self::default();
        for characteristic in [
            AppCharacteristic::IndoorBikeData,
            AppCharacteristic::TrainingStatus,
            AppCharacteristic::FitnessMachineStatus,
            AppCharacteristic::FtmsFeatureRelay,
            AppCharacteristic::ServiceChanged,
            AppCharacteristic::ControlPoint,
        ] {
            mock.set_subscribers(characteristic, 1);
        }
        mock
    }

    pub fn set_subscribers(&self, characteristic: AppCharacteristic, count: usize) {
        self.subscribers
            .lock()
            .unwrap()
            .insert(characteristic, count);
    }

    pub fn set_advertising(&self, advertising: bool) {
        self.advertising.store(advertising, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PeripheralCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Payloads sent on one characteristic, notify or indicate
    pub fn sent(&self, characteristic: AppCharacteristic) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PeripheralCall::Notify(c, value) | PeripheralCall::Indicate(c, value)
                    if c == characteristic =>
                {
                    Some(value)
                }
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: PeripheralCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeripheralTransport for MockPeripheral {
    async fn start_advertising(&self) -> Result<()> {
        self.record(PeripheralCall::StartAdvertising);
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    async fn notify(&self, characteristic: AppCharacteristic, value: &[u8]) -> Result<()> {
        self.record(PeripheralCall::Notify(characteristic, value.to_vec()));
        Ok(())
    }

    async fn indicate(&self, characteristic: AppCharacteristic, value: &[u8]) -> Result<()> {
        self.record(PeripheralCall::Indicate(characteristic, value.to_vec()));
        Ok(())
    }

    async fn subscriber_count(&self, characteristic: AppCharacteristic) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(&characteristic)
            .copied()
            .unwrap_or(0)
    }
}
