//! Error taxonomy surfaced by the device layer.

use crate::domain::models::ConsentKind;
use crate::infrastructure::bluetooth::protocol::CharacteristicRole;
use crate::infrastructure::bluetooth::transport::TransportError;
use thiserror::Error;

pub type Result<T, E = DeviceError> = std::result::Result<T, E>;

/// Why a bulk transfer was abandoned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// `expected` is unknown when the device rejects a chunk without
    /// echoing a checksum; `actual` is unknown for any device-side rejection.
    #[error(
        "CRC mismatch (expected {}, got {})",
        fmt_crc(.expected, "an unreported value"),
        fmt_crc(.actual, "a device-side rejection")
    )]
    CrcMismatch {
        expected: Option<u32>,
        actual: Option<u32>,
    },
    #[error("no progress before the stall deadline")]
    StallTimeout,
    #[error("size mismatch (expected {expected} bytes, got {actual})")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("device reported error {0:#04x}")]
    DeviceError(u8),
    #[error("device never granted an initial credit")]
    NoInitialCredit,
    #[error("chunk write failed after {attempts} attempts")]
    WriteFailed { attempts: u32 },
    #[error("link lost mid-transfer")]
    Disconnected,
    #[error("cancelled")]
    Cancelled,
}

fn fmt_crc(crc: &Option<u32>, missing: &str) -> String {
    match crc {
        Some(crc) => format!("{crc:#010x}"),
        None => missing.to_string(),
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("{0} consent was denied or timed out")]
    ConsentDenied(ConsentKind),

    #[error("device did not signal ready within {timeout_ms} ms")]
    PacingTimeout { timeout_ms: u64 },

    #[error("characteristic not available: {0}")]
    CharacteristicMissing(CharacteristicRole),

    #[error("transfer '{name}' aborted: {reason}")]
    TransferAbort { name: String, reason: AbortReason },

    #[error("read failed after reconnect: {source}")]
    ReconnectExhausted {
        #[source]
        source: TransportError,
    },

    #[error("device disconnected")]
    Disconnected,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("device storage is full ({limit} images)")]
    StorageFull { limit: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeviceError {
    pub fn abort(name: impl Into<String>, reason: AbortReason) -> Self {
        Self::TransferAbort {
            name: name.into(),
            reason,
        }
    }

    /// The abort reason, if this error ended a transfer.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            Self::TransferAbort { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Fatal errors must not be retried by callers.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConsentDenied(_)
                | Self::ReconnectExhausted { .. }
                | Self::TransferAbort {
                    reason: AbortReason::CrcMismatch { .. },
                    ..
                }
        )
    }
}
