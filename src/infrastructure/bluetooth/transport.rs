//! GATT transport seam.
//!
//! Everything above this trait is backend-agnostic: the real backend is
//! [`BtleplugTransport`](super::btleplug_transport::BtleplugTransport), tests
//! use [`MockTransport`](super::mock::MockTransport).

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the notification fan-out channel.
pub const EVENT_CAPACITY: usize = 512;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("GATT operation already in progress: {0}")]
    Busy(String),
    #[error("no Bluetooth adapter available")]
    NoAdapter,
    #[error("no matching peripheral found")]
    PeripheralNotFound,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

impl TransportError {
    /// The stack is still processing a previous GATT operation.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Io(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("in progress") || msg.contains("busy")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// What `open` selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub id: String,
    pub name: Option<String>,
    /// The peripheral was found through a service-UUID filter.
    pub matched_service: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification { uuid: Uuid, value: Vec<u8> },
    Disconnected,
}

#[async_trait]
pub trait GattTransport: Send + Sync {
    async fn open(&self) -> Result<PeripheralInfo, TransportError>;

    /// Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    /// (Re)discovers services and lists every characteristic UUID found.
    async fn discover(&self) -> Result<Vec<Uuid>, TransportError>;

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, uuid: Uuid, value: &[u8], mode: WriteMode)
        -> Result<(), TransportError>;

    async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError>;

    /// A fresh receiver; only events sent after this call are observed.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
