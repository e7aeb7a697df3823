//! Companion client for the Rosary BLE peripheral.
//!
//! The crate is split the same way the device is talked to:
//!
//! - [`domain`] holds plain data: lifecycle events, settings, the prayer
//!   history record format and partial payload recovery.
//! - [`infrastructure::bluetooth`] owns the link: transport seam, consent,
//!   pacing and robust reads.
//! - [`infrastructure::transfer`] is the chunked bulk-transfer engine.
//! - [`infrastructure::sync`] drives the engine for history, wallpapers and
//!   the info characteristics, and maps JSON backups onto restore writes.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    ConsentKind, DeviceInfo, KeysMode, LinkState, MessageSeverity, SessionEvent, StatusMessage,
    TransferDirection, TransferProgress,
};
pub use error::{AbortReason, DeviceError, Result};
pub use infrastructure::bluetooth::{
    connection::ConnectionConfig,
    protocol::CharacteristicRole,
    service::{DeviceSession, SessionConfig},
    transport::{GattTransport, TransportError, TransportEvent},
};
pub use infrastructure::sync::{
    backup::Backup, history::HistorySync, info::InfoSync, queue::SyncQueue, wallpaper::WallpaperSync,
};
pub use infrastructure::transfer::TransferTiming;
