use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    central::CentralTransport,
    error::{BridgeError, Result},
    types::{
        BikeEvent, BridgeConfig, BridgeEvent, CharacteristicHandle, CharacteristicProperties,
        DiscoveredDevice, ServiceHandle,
    },
};

/// Bike-facing transport backed by the first local Bluetooth adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    connected: Arc<Mutex<Option<Peripheral>>>,
    scanning: Arc<AtomicBool>,
    connect_timeout_ms: u64,
    events: mpsc::UnboundedSender<BridgeEvent>,
    adapter_task: JoinHandle<()>,
    notification_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugCentral {
    /// Open the first Bluetooth adapter and start forwarding its events
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] if no Bluetooth adapter is available,
    /// or [`BridgeError::Ble`] if the adapter cannot be initialized.
    pub async fn new(
        config: &BridgeConfig,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BridgeError::DeviceNotFound)?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }

        let connected = Arc::new(Mutex::new(None));
        let scanning = Arc::new(AtomicBool::new(false));
        let adapter_events = adapter.events().await?;

        let adapter_task = tokio::spawn(forward_adapter_events(
            adapter.clone(),
            adapter_events,
            Arc::clone(&connected),
            Arc::clone(&scanning),
            events.clone(),
        ));

        Ok(Self {
            adapter,
            connected,
            scanning,
            connect_timeout_ms: config.connect_timeout_ms,
            events,
            adapter_task,
            notification_task: Mutex::new(None),
        })
    }

    async fn peripheral(&self) -> Result<Peripheral> {
        self.connected
            .lock()
            .await
            .clone()
            .ok_or(BridgeError::NotConnected)
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| address_matches(p.address(), address))
            .ok_or(BridgeError::DeviceNotFound)
    }

    async fn resolve(&self, handle: &CharacteristicHandle) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral().await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service_uuid)
            .ok_or_else(|| BridgeError::CharacteristicNotFound(handle.uuid.to_string()))?;
        Ok((peripheral, characteristic))
    }

    async fn start_session(&self, peripheral: &Peripheral) -> Result<JoinHandle<()>> {
        peripheral.discover_services().await?;
        let notifications = peripheral.notifications().await?;
        Ok(tokio::spawn(forward_notifications(
            notifications,
            self.events.clone(),
        )))
    }

    async fn stop_notifications(&self) {
        if let Some(task) = self.notification_task.lock().await.take() {
            task.abort();
        }
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.adapter_task.abort();
    }
}

#[async_trait]
impl CentralTransport for BtleplugCentral {
    async fn start_scan(&self) -> Result<()> {
        info!("Starting scan for the bike...");
        self.scanning.store(true, Ordering::SeqCst);
        if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.adapter.stop_scan().await?;
            info!("Scan stopped");
        }
        Ok(())
    }

    async fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self.find_peripheral(address).await?;
        info!("Connecting to bike {}", address);

        match timeout(
            Duration::from_millis(self.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BridgeError::ConnectionFailed(e.to_string())),
            Err(_) => {
                drop_link(&peripheral).await;
                return Err(BridgeError::Timeout {
                    timeout_ms: self.connect_timeout_ms,
                });
            }
        }

        let task = match self.start_session(&peripheral).await {
            Ok(task) => task,
            Err(e) => {
                warn!("Bike setup failed after connecting: {}", e);
                drop_link(&peripheral).await;
                return Err(e);
            }
        };
        if let Some(previous) = self.notification_task.lock().await.replace(task) {
            previous.abort();
        }

        *self.connected.lock().await = Some(peripheral);
        info!("Connected to bike {}", address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_notifications().await;
        let peripheral = self.connected.lock().await.take();
        if let Some(peripheral) = peripheral {
            info!("Disconnecting from bike {}", peripheral.address());
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_service(&self, uuid: Uuid) -> Result<Option<ServiceHandle>> {
        let peripheral = self.peripheral().await?;
        Ok(peripheral
            .services()
            .iter()
            .find(|s| s.uuid == uuid)
            .map(|s| ServiceHandle { uuid: s.uuid }))
    }

    async fn get_characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicHandle>> {
        let peripheral = self.peripheral().await?;
        Ok(peripheral
            .services()
            .iter()
            .filter(|s| s.uuid == service.uuid)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
            .map(|c| CharacteristicHandle {
                service_uuid: c.service_uuid,
                uuid: c.uuid,
                properties: properties_from_flags(c.properties),
            }))
    }

    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
        let (peripheral, characteristic) = self.resolve(characteristic).await?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| BridgeError::SubscriptionFailed(format!("{}: {e}", characteristic.uuid)))
    }

    async fn write_value(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.resolve(characteristic).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("Writing {:02X?} to {}", value, characteristic.uuid);
        peripheral.write(&characteristic, value, write_type).await?;
        Ok(())
    }

    async fn read_value(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.resolve(characteristic).await?;
        Ok(peripheral.read(&characteristic).await?)
    }
}

/// Forward advertisements while scanning and drops of the connected bike
async fn forward_adapter_events(
    adapter: Adapter,
    mut adapter_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    connected: Arc<Mutex<Option<Peripheral>>>,
    scanning: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<BridgeEvent>,
) {
    while let Some(event) = adapter_events.next().await {
        let event = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !scanning.load(Ordering::SeqCst) {
                    continue;
                }
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let properties = peripheral.properties().await.ok().flatten();
                BikeEvent::DeviceDiscovered(DiscoveredDevice {
                    address: peripheral.address().to_string(),
                    name: properties.as_ref().and_then(|p| p.local_name.clone()),
                    rssi: properties.and_then(|p| p.rssi),
                })
            }
            CentralEvent::DeviceDisconnected(id) => {
                let mut connected = connected.lock().await;
                if connected.as_ref().map(btleplug::api::Peripheral::id) != Some(id) {
                    continue;
                }
                *connected = None;
                warn!("Bike disconnected");
                BikeEvent::Disconnected
            }
            _ => continue,
        };

        if events.send(event.into()).is_err() {
            debug!("Bridge event channel closed, stopping adapter watcher");
            break;
        }
    }
}

async fn forward_notifications(
    mut notifications: std::pin::Pin<
        Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>,
    >,
    events: mpsc::UnboundedSender<BridgeEvent>,
) {
    while let Some(notification) = notifications.next().await {
        let event = BikeEvent::Notification {
            characteristic: notification.uuid,
            value: notification.value,
        };
        if events.send(event.into()).is_err() {
            error!("Bridge event channel closed, dropping bike notifications");
            break;
        }
    }
}

/// Tear down a link the bridge is not going to track
async fn drop_link(peripheral: &Peripheral) {
    if let Err(e) = peripheral.disconnect().await {
        warn!("Failed to drop bike link {}: {}", peripheral.address(), e);
    }
}

fn address_matches(address: BDAddr, wanted: &str) -> bool {
    address.to_string().eq_ignore_ascii_case(wanted.trim())
}

/// Map btleplug property flags onto the transport-neutral representation
#[must_use]
pub fn properties_from_flags(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}
