use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle notifications pushed to whoever owns the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected(DeviceInfo),
    Disconnected,
    Transfer(TransferProgress),
    Log(StatusMessage),
}

/// Link state as observed by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What the client learned about the peripheral once it was connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: Option<String>,
    pub consent: bool,
    pub file_system: bool,
    pub remote_touch: bool,
    pub remote_keys: bool,
    pub key_store: bool,
}

/// Features gated behind an on-device approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsentKind {
    Dashboard,
    KeyExport,
    KeyRestore,
}

impl ConsentKind {
    pub const fn hello_frame(self) -> &'static [u8] {
        match self {
            Self::Dashboard => &[0x41],
            Self::KeyExport => &[0x64, 0x01],
            Self::KeyRestore => &[0x64, 0x02],
        }
    }

    /// `(granted, denied)` status bytes for this handshake.
    pub const fn status_bytes(self) -> (u8, u8) {
        match self {
            Self::Dashboard => (0xA1, 0xA0),
            Self::KeyExport | Self::KeyRestore => (0xB1, 0xB0),
        }
    }
}

impl fmt::Display for ConsentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Dashboard => "dashboard",
            Self::KeyExport => "key export",
            Self::KeyRestore => "key restore",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysMode {
    Export,
    Restore,
}

impl From<KeysMode> for ConsentKind {
    fn from(mode: KeysMode) -> Self {
        match mode {
            KeysMode::Export => ConsentKind::KeyExport,
            KeysMode::Restore => ConsentKind::KeyRestore,
        }
    }
}

/// Device identity keys as exported by the key store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    pub id: String,
    pub pub_key: String,
    pub priv_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Opening,
    Active,
    Closing,
    Completed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub name: String,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub transferred: usize,
    pub total: Option<usize>,
}

impl TransferProgress {
    pub fn percent(&self) -> Option<u8> {
        let total = self.total.filter(|t| *t > 0)?;
        Some(((self.transferred.min(total) * 100) / total) as u8)
    }
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
