//! Bluetooth Module
//!
//! BLE communication with the Rosary device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceSession                        │
//! │   (consent, paced writes, robust reads, keys, remote)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌─────────────┐ ┌────────────┐ ┌──────────┐
//! │ Connection  │ │  Pacing    │ │ Protocol │
//! │             │ │            │ │          │
//! │ - bindings  │ │ - ready    │ │ - UUIDs  │
//! │ - reconnect │ │   permit   │ │ - frames │
//! └──────┬──────┘ └────────────┘ └──────────┘
//!        │
//!        ▼
//! ┌─────────────────────────────────────────┐
//! │       GattTransport (btleplug / mock)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Backend-agnostic GATT seam and its events
//! - [`btleplug_transport`] - Real backend over btleplug
//! - `mock` - Scripted in-memory peripheral (tests and the `test-util` feature)
//! - [`scanner`] - BLE device discovery and candidate ranking
//! - [`connection`] - Link lifecycle and characteristic binding
//! - [`consent`] - On-device consent handshake
//! - [`pacing`] - Ready-signal write pacing
//! - [`robust_io`] - Reads with retry, re-bind and reconnect
//! - [`protocol`] - UUIDs, opcodes and frame builders
//! - [`service`] - Session coordinator

pub mod btleplug_transport;
pub mod connection;
pub mod consent;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod pacing;
pub mod protocol;
pub mod robust_io;
pub mod scanner;
pub mod service;
pub mod transport;

pub use service::DeviceSession;
