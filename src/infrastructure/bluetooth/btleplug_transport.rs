//! btleplug-backed [`GattTransport`].
//!
//! `open` scans once and then keeps reusing the selected peripheral, so a
//! forced reconnect lands on the same device. Two pump tasks feed the event
//! channel: the peripheral's notification stream and the adapter's
//! `DeviceDisconnected` events for that peripheral.

use super::scanner::{BleScanner, ScanConfig};
use super::transport::{
    GattTransport, PeripheralInfo, TransportError, TransportEvent, WriteMode, EVENT_CAPACITY,
};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

struct Selected {
    peripheral: Peripheral,
    info: PeripheralInfo,
}

pub struct BtleplugTransport {
    scanner: BleScanner,
    selected: Mutex<Option<Selected>>,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<TransportEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BtleplugTransport {
    pub fn new(adapter: Adapter, config: ScanConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            scanner: BleScanner::new(adapter, config),
            selected: Mutex::new(None),
            characteristics: Mutex::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Uses the first adapter the platform reports.
    pub async fn with_default_adapter(config: ScanConfig) -> Result<Self, TransportError> {
        Ok(Self::new(BleScanner::default_adapter().await?, config))
    }

    fn peripheral(&self) -> Result<Peripheral, TransportError> {
        lock(&self.selected)
            .as_ref()
            .map(|s| s.peripheral.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        lock(&self.characteristics)
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    async fn select(&self) -> Result<(Peripheral, PeripheralInfo), TransportError> {
        if let Some(selected) = lock(&self.selected).as_ref() {
            return Ok((selected.peripheral.clone(), selected.info.clone()));
        }
        let device = self.scanner.select().await?;
        let info = PeripheralInfo {
            id: device.candidate.id,
            name: device.candidate.name,
            matched_service: device.candidate.advertises_service,
        };
        *lock(&self.selected) = Some(Selected {
            peripheral: device.peripheral.clone(),
            info: info.clone(),
        });
        Ok((device.peripheral, info))
    }

    async fn spawn_pumps(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        self.stop_pumps();

        let mut notifications = peripheral.notifications().await?;
        let sender = self.events.clone();
        let notification_pump = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let _ = sender.send(TransportEvent::Notification {
                    uuid: n.uuid,
                    value: n.value,
                });
            }
            debug!("Notification stream ended");
        });

        let mut central = self.scanner.adapter().events().await?;
        let sender = self.events.clone();
        let id = peripheral.id();
        let disconnect_pump = tokio::spawn(async move {
            while let Some(event) = central.next().await {
                if let CentralEvent::DeviceDisconnected(dropped) = event {
                    if dropped == id {
                        info!("Adapter reports {:?} disconnected", dropped);
                        let _ = sender.send(TransportEvent::Disconnected);
                    }
                }
            }
        });

        lock(&self.pumps).extend([notification_pump, disconnect_pump]);
        Ok(())
    }

    fn stop_pumps(&self) {
        for pump in lock(&self.pumps).drain(..) {
            pump.abort();
        }
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn open(&self) -> Result<PeripheralInfo, TransportError> {
        let (peripheral, info) = self.select().await?;
        if !peripheral.is_connected().await? {
            timeout(CONNECT_TIMEOUT, peripheral.connect())
                .await
                .map_err(|_| TransportError::Io("connect timed out".into()))??;
        }
        self.spawn_pumps(&peripheral).await?;
        info!(id = %info.id, "Peripheral connected");
        Ok(info)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.stop_pumps();
        lock(&self.characteristics).clear();
        let Ok(peripheral) = self.peripheral() else {
            return Ok(());
        };
        let was_connected = peripheral.is_connected().await.unwrap_or(false);
        if was_connected {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Peripheral disconnect failed: {}", e);
            }
            let _ = self.events.send(TransportEvent::Disconnected);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.peripheral() {
            Ok(p) => p.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn discover(&self) -> Result<Vec<Uuid>, TransportError> {
        let peripheral = self.peripheral()?;
        timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Io("service discovery timed out".into()))??;

        let mut found = HashMap::new();
        for c in peripheral.characteristics() {
            found.entry(c.uuid).or_insert(c);
        }
        let uuids: Vec<Uuid> = found.keys().copied().collect();
        debug!("Discovered {} characteristics", uuids.len());
        *lock(&self.characteristics) = found;
        Ok(uuids)
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = self.characteristic(uuid)?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write(
        &self,
        uuid: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = self.characteristic(uuid)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        Ok(peripheral.write(&characteristic, value, write_type).await?)
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = self.characteristic(uuid)?;
        Ok(peripheral.subscribe(&characteristic).await?)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.stop_pumps();
    }
}
