use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    central::{
        discover_bike, send_init_sequence, CentralLifecycle, CentralTransport, DiscoveryOutcome,
    },
    error::Result,
    peripheral::{
        ensure_advertising, indicate_service_changed, notify_subscribers, send_status,
        GattProfile, PeripheralLifecycle, PeripheralTransport, SubscribeAction,
    },
    protocol::{
        decode_bike_ftms_like, decode_bike_proprietary, ftms_data_flags, ftms_like_candidate,
    },
    store::SensorStore,
    types::{
        AppCharacteristic, AppEvent, BikeCharacteristic, BikeEvent, BridgeConfig, BridgeEvent,
        CentralConnectionState, DiscoveryReport, PeripheralConnectionState,
    },
};

/// The bridge: shared store, both lifecycles, and the transports they drive.
///
/// Events from either transport go through [`FtmsBridge::handle_event`], one
/// at a time. Slow BLE procedures (connect, discovery, the bike init
/// sequence) run as spawned tasks that post their completion back as events,
/// so the handler never waits on the radio.
pub struct FtmsBridge<C: ?Sized, P: ?Sized> {
    config: BridgeConfig,
    profile: GattProfile,
    central: Arc<C>,
    peripheral: Arc<P>,
    store: SensorStore,
    bike: Mutex<CentralLifecycle>,
    app: Mutex<PeripheralLifecycle>,
    events: mpsc::WeakUnboundedSender<BridgeEvent>,
}

impl<C, P> FtmsBridge<C, P>
where
    C: CentralTransport + ?Sized + 'static,
    P: PeripheralTransport + ?Sized + 'static,
{
    /// Create a bridge.
    ///
    /// `events` must feed the receiver later passed to [`FtmsBridge::run`]; the
    /// bridge only keeps a weak handle, so the loop ends once the transports
    /// drop theirs.
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        central: Arc<C>,
        peripheral: Arc<P>,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        Self {
            profile: GattProfile::new(&config),
            config,
            central,
            peripheral,
            store: SensorStore::new(),
            bike: Mutex::new(CentralLifecycle::new()),
            app: Mutex::new(PeripheralLifecycle::new()),
            events: events.downgrade(),
        }
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// GATT table the app-facing server should expose
    #[must_use]
    pub const fn profile(&self) -> &GattProfile {
        &self.profile
    }

    /// Shared sensor and target state
    #[must_use]
    pub const fn store(&self) -> &SensorStore {
        &self.store
    }

    /// Bike-facing state
    pub async fn central_state(&self) -> CentralConnectionState {
        self.bike.lock().await.state()
    }

    /// App-facing state
    pub async fn peripheral_state(&self) -> PeripheralConnectionState {
        self.app.lock().await.state()
    }

    /// Start advertising to apps and scanning for the bike
    ///
    /// # Errors
    ///
    /// Returns the transport's error if advertising or scanning cannot start.
    pub async fn start(&self) -> Result<()> {
        ensure_advertising(&*self.peripheral).await?;
        self.request_scan().await
    }

    /// Start scanning for the bike
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`](crate::BridgeError::InvalidTransition)
    /// if the bike is already found or connected, or the transport's error if the
    /// scan cannot start.
    pub async fn request_scan(&self) -> Result<()> {
        let mut bike = self.bike.lock().await;
        if !bike.request_scan()? {
            debug!("Scan already running");
            return Ok(());
        }

        if let Err(e) = self.central.start_scan().await {
            error!("Failed to start scan: {}", e);
            bike.scan_failed();
            return Err(e);
        }
        Ok(())
    }

    /// Connect to the bike found by the last scan
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`](crate::BridgeError::InvalidTransition)
    /// if no bike has been found yet.
    pub async fn request_connect(&self) -> Result<()> {
        let Some(address) = self.bike.lock().await.request_connect()? else {
            return Ok(());
        };

        let Some(events) = self.events.upgrade() else {
            warn!("Event channel closed, not connecting");
            self.bike.lock().await.on_connect_failed();
            return Ok(());
        };

        let central = Arc::clone(&self.central);
        tokio::spawn(async move {
            let event = match central.connect(&address).await {
                Ok(()) => BikeEvent::Connected,
                Err(e) => BikeEvent::ConnectFailed(e.to_string()),
            };
            let _ = events.send(event.into());
        });
        Ok(())
    }

    /// Drop the bike link (or stop looking for it) and reset the bike state
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the link cannot be closed; the local
    /// state is reset either way.
    pub async fn disconnect_bike(&self) -> Result<()> {
        let has_link = self.bike.lock().await.begin_disconnect();

        let mut result = Ok(());
        if self.central.is_scanning().await {
            result = self.central.stop_scan().await;
        }
        if has_link {
            result = result.and(self.central.disconnect().await);
        }

        self.on_bike_disconnected().await;
        result
    }

    /// Notify the app with the current Indoor Bike Data frame.
    ///
    /// Returns whether a frame went out.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the notify fails.
    pub async fn publish_indoor_bike_data(&self) -> Result<bool> {
        let frame = self.store.encode_indoor_bike_data().await;
        let app = self.app.lock().await;
        let sent = notify_subscribers(
            &*self.peripheral,
            &app,
            AppCharacteristic::IndoorBikeData,
            &frame,
        )
        .await?;
        if sent {
            trace!("Sent Indoor Bike Data {:02X?}", &frame[..]);
        }
        Ok(sent)
    }

    /// Process events and publish Indoor Bike Data until the channel closes
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
        let mut publish =
            tokio::time::interval(Duration::from_millis(self.config.data_interval_ms.max(1)));
        publish.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Event channel closed, bridge stopping");
                        break;
                    }
                },
                _ = publish.tick() => {
                    if let Err(e) = self.publish_indoor_bike_data().await {
                        warn!("Failed to publish Indoor Bike Data: {}", e);
                    }
                }
            }
        }
    }

    /// Handle one event from either side
    pub async fn handle_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Bike(event) => self.handle_bike_event(event).await,
            BridgeEvent::App(event) => self.handle_app_event(event).await,
        }
    }

    async fn handle_bike_event(&self, event: BikeEvent) {
        match event {
            BikeEvent::ScanRequested => {
                if let Err(e) = self.request_scan().await {
                    warn!("Scan request rejected: {}", e);
                }
            }
            BikeEvent::DeviceDiscovered(device) => {
                let found = self
                    .bike
                    .lock()
                    .await
                    .on_device_discovered(device, &self.config);
                if !found {
                    return;
                }

                if self.central.is_scanning().await {
                    if let Err(e) = self.central.stop_scan().await {
                        warn!("Failed to stop scan: {}", e);
                    }
                }

                if self.config.auto_connect {
                    if let Err(e) = self.request_connect().await {
                        warn!("Connect request rejected: {}", e);
                    }
                } else {
                    info!("Bike found, waiting for a connect request");
                }
            }
            BikeEvent::ConnectRequested => {
                if let Err(e) = self.request_connect().await {
                    warn!("Connect request rejected: {}", e);
                }
            }
            BikeEvent::Connected => {
                if self.bike.lock().await.on_connected() {
                    self.spawn_discovery();
                } else if let Err(e) = self.central.disconnect().await {
                    warn!("Failed to drop late bike link: {}", e);
                }
            }
            BikeEvent::ConnectFailed(reason) => {
                if self.bike.lock().await.on_connect_failed() {
                    warn!("Failed to connect to bike: {}", reason);
                }
            }
            BikeEvent::DiscoveryFinished(report) => self.on_discovery(report).await,
            BikeEvent::Disconnected => self.on_bike_disconnected().await,
            BikeEvent::Notification {
                characteristic,
                value,
            } => {
                if !self.bike.lock().await.accepts_notifications() {
                    debug!("Dropping bike notification while not connected");
                    return;
                }

                match BikeCharacteristic::from_uuid(characteristic) {
                    Some(BikeCharacteristic::CustomData) => self.on_custom_data(&value).await,
                    Some(BikeCharacteristic::FtmsFeature) => self.on_ftms_feature(&value).await,
                    Some(BikeCharacteristic::FtmsData) => {
                        debug!(
                            "Bike 0x2ACC notification, flags {:04X?}: {:02X?}",
                            ftms_data_flags(&value),
                            value
                        );
                    }
                    _ => debug!(
                        "Notification from unexpected characteristic {}: {:02X?}",
                        characteristic, value
                    ),
                }
            }
        }
    }

    async fn handle_app_event(&self, event: AppEvent) {
        match event {
            AppEvent::Connected { peer } => self.app.lock().await.on_connected(peer),
            AppEvent::Disconnected => {
                self.app.lock().await.on_disconnected();
                if let Err(e) = ensure_advertising(&*self.peripheral).await {
                    error!("Failed to restart advertising: {}", e);
                }
            }
            AppEvent::Subscribed {
                characteristic,
                cccd,
            } => {
                let mut app = self.app.lock().await;
                let result = match app.on_subscribe(characteristic, cccd) {
                    Some(SubscribeAction::SyncStatus(update)) => {
                        send_status(&*self.peripheral, &mut app, update).await
                    }
                    Some(SubscribeAction::IndicateServiceChanged) => {
                        indicate_service_changed(&*self.peripheral, &app).await
                    }
                    None => Ok(false),
                };
                if let Err(e) = result {
                    warn!("Failed to sync {} on subscribe: {}", characteristic, e);
                }
            }
            AppEvent::ControlPointWritten(data) => self.on_control_point(&data).await,
        }
    }

    async fn on_control_point(&self, data: &[u8]) {
        debug!("Control point write: {:02X?}", data);
        let Some(outcome) = self.store.process_control(data).await else {
            return;
        };

        let mut app = self.app.lock().await;
        if !app.is_connected() {
            debug!("App gone, dropping control point response");
            return;
        }

        let response = outcome.response.to_bytes();
        match self
            .peripheral
            .indicate(AppCharacteristic::ControlPoint, &response)
            .await
        {
            Ok(()) => debug!("Indicated control point response {:02X?}", response),
            Err(e) => warn!("Failed to indicate control point response: {}", e),
        }

        for update in outcome.follow_ups {
            if let Err(e) = send_status(&*self.peripheral, &mut app, update).await {
                warn!("Failed to send {}: {}", update.characteristic, e);
            }
        }
    }

    async fn on_custom_data(&self, value: &[u8]) {
        trace!("Bike 0xFFF1: {:02X?}", value);
        match decode_bike_proprietary(value) {
            Some(delta) => self.store.apply_delta(delta).await,
            None => debug!("Ignoring bike frame {:02X?}", value),
        }
    }

    async fn on_ftms_feature(&self, value: &[u8]) {
        trace!("Bike 0x2AD2: {:02X?}", value);
        let accepted = match decode_bike_ftms_like(value) {
            Some(level) => self.store.set_apparent_resistance(level).await,
            None => false,
        };
        if !accepted {
            debug!(
                "No resistance in bike frame, candidate {:?}",
                ftms_like_candidate(value)
            );
        }

        let app = self.app.lock().await;
        if let Err(e) =
            notify_subscribers(&*self.peripheral, &app, AppCharacteristic::FtmsFeatureRelay, value)
                .await
        {
            warn!("Failed to relay bike 0x2AD2: {}", e);
        }
    }

    async fn on_discovery(&self, report: DiscoveryReport) {
        let features = report.features;
        let outcome = self.bike.lock().await.on_discovery(report);

        match outcome {
            DiscoveryOutcome::Ready { control_point } => {
                info!("Bike ready");
                if let Some(features) = features {
                    self.store.set_features(features).await;
                }
                if let Some(control_point) = control_point {
                    let central = Arc::clone(&self.central);
                    let settle = Duration::from_millis(self.config.control_settle_ms);
                    tokio::spawn(async move {
                        send_init_sequence(&*central, &control_point, settle).await;
                    });
                }
            }
            DiscoveryOutcome::Fatal => {
                if let Err(e) = self.central.disconnect().await {
                    warn!("Failed to drop bike link: {}", e);
                }
                self.on_bike_disconnected().await;
            }
            DiscoveryOutcome::Stale => {}
        }
    }

    async fn on_bike_disconnected(&self) {
        self.bike.lock().await.on_disconnected();
        self.store.reset_sensor().await;
        info!("Bike state reset");
    }

    fn spawn_discovery(&self) {
        let Some(events) = self.events.upgrade() else {
            warn!("Event channel closed, skipping discovery");
            return;
        };

        let central = Arc::clone(&self.central);
        let settle = Duration::from_millis(self.config.connect_settle_ms);
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let report = discover_bike(&*central).await;
            let _ = events.send(BikeEvent::DiscoveryFinished(report).into());
        });
    }
}
