//! Rosary device GATT protocol
//!
//! UUIDs, characteristic roles and the control-channel command frames shared
//! by every feature. Bulk-transfer opcodes live with the sync driver that
//! owns them.

use crate::error::{DeviceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Info/OTA service advertised by the firmware.
pub const INFO_SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abcdef0";
/// File-system service used by history and wallpaper transfers.
pub const FS_SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abcf000";

pub const CONTROL_UUID: &str = "b8a7a0e2-1a5d-4c1e-9d93-2c9e2b9e10ff";
pub const STATUS_UUID: &str = "12345678-1234-5678-1234-56789abcdef2";
pub const SETTINGS_UUID: &str = "b8a7a0e2-1a5d-4c1e-9d93-2c9e2b9e1002";
pub const STATS_UUID: &str = "b8a7a0e2-1a5d-4c1e-9d93-2c9e2b9e1001";
pub const PARTS_UUID: &str = "b8a7a0e2-1a5d-4c1e-9d93-2c9e2b9e1003";
pub const INTENTIONS_UUID: &str = "b8a7a0e2-1a5d-4c1e-9d93-2c9e2b9e1010";
pub const INTENTION_ENTRY_UUID: &str = "b8a7a0e2-1a5d-4c1e-9d93-2c9e2b9e1011";
pub const AUTH_INFO_UUID: &str = "8b40f200-78e7-4a6b-b1d3-6b5f3a10a201";
pub const AUTH_CONTROL_UUID: &str = "8b40f201-78e7-4a6b-b1d3-6b5f3a10a201";
pub const TOUCH_UUID: &str = "12345678-1234-5678-1234-56789abcdea1";
pub const KEYS_UUID: &str = "12345678-1234-5678-1234-56789abcdea2";
pub const FS_CONTROL_UUID: &str = "12345678-1234-5678-1234-56789abcf001";
pub const FS_INFO_UUID: &str = "12345678-1234-5678-1234-56789abcf002";
pub const FS_DATA_UUID: &str = "12345678-1234-5678-1234-56789abcf003";
pub const FS_STATUS_UUID: &str = "12345678-1234-5678-1234-56789abcf004";

/// Control-channel opcodes.
pub mod opcode {
    pub const HELLO: u8 = 0x41;
    pub const SET_PREF: u8 = 0x50;
    pub const SET_STAT: u8 = 0x53;
    pub const RESTORE_BEGIN: u8 = 0x54;
    pub const RESTORE_DONE: u8 = 0x55;
    pub const AUTH_BEGIN: u8 = 0x60;
    pub const AUTH_SET: u8 = 0x61;
    pub const AUTH_COMMIT: u8 = 0x62;
    pub const KEYS_HELLO: u8 = 0x64;
}

/// Status-channel bytes.
pub mod status {
    pub const READY: u8 = 0x01;
    pub const CONSENT_DENIED: u8 = 0xA0;
    pub const CONSENT_GRANTED: u8 = 0xA1;
    pub const KEYS_DENIED: u8 = 0xB0;
    pub const KEYS_GRANTED: u8 = 0xB1;
}

/// A named characteristic the client binds by UUID.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CharacteristicRole {
    Control,
    Status,
    Settings,
    Stats,
    Parts,
    Intentions,
    IntentionEntry,
    AuthInfo,
    AuthControl,
    Touch,
    Keys,
    FsControl,
    FsInfo,
    FsData,
    FsStatus,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 15] = [
        Self::Control,
        Self::Status,
        Self::Settings,
        Self::Stats,
        Self::Parts,
        Self::Intentions,
        Self::IntentionEntry,
        Self::AuthInfo,
        Self::AuthControl,
        Self::Touch,
        Self::Keys,
        Self::FsControl,
        Self::FsInfo,
        Self::FsData,
        Self::FsStatus,
    ];

    /// Binding failure of a mandatory role fails the connection.
    pub fn is_mandatory(self) -> bool {
        matches!(self, Self::Control | Self::Status)
    }

    /// Roles the client enables notifications on once bound.
    pub fn notifies(self) -> bool {
        matches!(
            self,
            Self::Status | Self::FsInfo | Self::FsData | Self::FsStatus
        )
    }

    pub fn default_uuid(self) -> &'static str {
        match self {
            Self::Control => CONTROL_UUID,
            Self::Status => STATUS_UUID,
            Self::Settings => SETTINGS_UUID,
            Self::Stats => STATS_UUID,
            Self::Parts => PARTS_UUID,
            Self::Intentions => INTENTIONS_UUID,
            Self::IntentionEntry => INTENTION_ENTRY_UUID,
            Self::AuthInfo => AUTH_INFO_UUID,
            Self::AuthControl => AUTH_CONTROL_UUID,
            Self::Touch => TOUCH_UUID,
            Self::Keys => KEYS_UUID,
            Self::FsControl => FS_CONTROL_UUID,
            Self::FsInfo => FS_INFO_UUID,
            Self::FsData => FS_DATA_UUID,
            Self::FsStatus => FS_STATUS_UUID,
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Control => "control",
            Self::Status => "status",
            Self::Settings => "settings",
            Self::Stats => "stats",
            Self::Parts => "parts",
            Self::Intentions => "intentions",
            Self::IntentionEntry => "intention entry",
            Self::AuthInfo => "auth info",
            Self::AuthControl => "auth control",
            Self::Touch => "touch",
            Self::Keys => "keys",
            Self::FsControl => "fs control",
            Self::FsInfo => "fs info",
            Self::FsData => "fs data",
            Self::FsStatus => "fs status",
        };
        f.write_str(name)
    }
}

/// Firmware UUID for every role.
pub fn default_characteristics() -> HashMap<CharacteristicRole, Uuid> {
    CharacteristicRole::ALL
        .iter()
        .filter_map(|role| {
            Uuid::parse_str(role.default_uuid())
                .ok()
                .map(|uuid| (*role, uuid))
        })
        .collect()
}

pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| DeviceError::InvalidFrame(format!("invalid UUID '{uuid_str}': {e}")))
}

/// Value carried by a key/value frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    Str(String),
}

impl KvValue {
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Bool(_) => 0x01,
            Self::U8(_) => 0x11,
            Self::U16(_) => 0x12,
            Self::U32(_) => 0x14,
            Self::U64(_) => 0x18,
            Self::I32(_) => 0x21,
            Self::Str(_) => 0x31,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Bool(v) => vec![u8::from(*v)],
            Self::U8(v) => vec![*v],
            Self::U16(v) => v.to_le_bytes().to_vec(),
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::U64(v) => v.to_le_bytes().to_vec(),
            Self::I32(v) => v.to_le_bytes().to_vec(),
            Self::Str(v) => v.as_bytes().to_vec(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Bool(_) | Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U32(_) | Self::I32(_) => 4,
            Self::U64(_) => 8,
            Self::Str(v) => v.len(),
        }
    }
}

/// Which table a restored value lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvTable {
    Pref,
    Stat,
}

impl KvTable {
    pub fn opcode(self) -> u8 {
        match self {
            Self::Pref => opcode::SET_PREF,
            Self::Stat => opcode::SET_STAT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub table: KvTable,
    pub key: String,
    pub value: KvValue,
}

impl KvEntry {
    pub fn frame(&self) -> Result<Vec<u8>> {
        pack_kv(self.table.opcode(), &self.key, &self.value)
    }

    /// Bytes this entry contributes to the RESTORE_BEGIN total.
    pub fn payload_len(&self) -> usize {
        self.key.len() + self.value.encoded_len()
    }
}

/// `[opcode][type][keyLen][key][value]`
pub fn pack_kv(op: u8, key: &str, value: &KvValue) -> Result<Vec<u8>> {
    let key_len = u8::try_from(key.len())
        .map_err(|_| DeviceError::InvalidFrame(format!("key too long: {} bytes", key.len())))?;
    let encoded = value.encode();
    let mut frame = Vec::with_capacity(3 + key.len() + encoded.len());
    frame.push(op);
    frame.push(value.type_code());
    frame.push(key_len);
    frame.extend_from_slice(key.as_bytes());
    frame.extend_from_slice(&encoded);
    Ok(frame)
}

/// `[0x54][steps u16 LE][payload bytes u32 LE]`
pub fn restore_begin_frame(steps: usize, payload_bytes: usize) -> Result<Vec<u8>> {
    let steps = u16::try_from(steps)
        .map_err(|_| DeviceError::InvalidFrame(format!("too many restore steps: {steps}")))?;
    let bytes = u32::try_from(payload_bytes)
        .map_err(|_| DeviceError::InvalidFrame("restore payload too large".into()))?;
    let mut frame = vec![opcode::RESTORE_BEGIN];
    frame.extend_from_slice(&steps.to_le_bytes());
    frame.extend_from_slice(&bytes.to_le_bytes());
    Ok(frame)
}

pub fn auth_set_frame(key: &str, value: &str) -> Result<Vec<u8>> {
    pack_kv(opcode::AUTH_SET, key, &KvValue::Str(value.to_string()))
}

/// `[op][nameLen][name]`, shared by the file-system commands.
pub fn name_frame(op: u8, name: &str) -> Result<Vec<u8>> {
    let len = u8::try_from(name.len())
        .map_err(|_| DeviceError::InvalidFrame(format!("name too long: {name}")))?;
    let mut frame = Vec::with_capacity(2 + name.len());
    frame.push(op);
    frame.push(len);
    frame.extend_from_slice(name.as_bytes());
    Ok(frame)
}

/// Touch report: big-endian x and y followed by the pressed flag.
pub fn touch_frame(x: u16, y: u16, down: bool) -> [u8; 5] {
    let [xh, xl] = x.to_be_bytes();
    let [yh, yl] = y.to_be_bytes();
    [xh, xl, yh, yl, u8::from(down)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_complete() {
        let table = default_characteristics();
        assert_eq!(table.len(), CharacteristicRole::ALL.len());
        assert_eq!(
            table[&CharacteristicRole::FsStatus],
            Uuid::parse_str(FS_STATUS_UUID).unwrap()
        );
    }

    #[test]
    fn test_only_control_and_status_are_mandatory() {
        let mandatory: Vec<_> = CharacteristicRole::ALL
            .iter()
            .filter(|r| r.is_mandatory())
            .collect();
        assert_eq!(
            mandatory,
            vec![&CharacteristicRole::Control, &CharacteristicRole::Status]
        );
    }

    #[test]
    fn test_pack_kv_layout() {
        let frame = pack_kv(opcode::SET_PREF, "bri", &KvValue::U16(0x0102)).unwrap();
        assert_eq!(frame, vec![0x50, 0x12, 3, b'b', b'r', b'i', 0x02, 0x01]);

        let frame = pack_kv(opcode::SET_STAT, "n", &KvValue::I32(-1)).unwrap();
        assert_eq!(frame, vec![0x53, 0x21, 1, b'n', 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_pack_kv_rejects_long_key() {
        let key = "k".repeat(256);
        assert!(pack_kv(opcode::SET_PREF, &key, &KvValue::Bool(true)).is_err());
    }

    #[test]
    fn test_auth_set_frame() {
        let frame = auth_set_frame("id", "ab").unwrap();
        assert_eq!(frame, vec![0x61, 0x31, 2, b'i', b'd', b'a', b'b']);
    }

    #[test]
    fn test_restore_begin_frame() {
        let frame = restore_begin_frame(3, 0x0102_0304).unwrap();
        assert_eq!(frame, vec![0x54, 3, 0, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_touch_frame_is_big_endian() {
        assert_eq!(touch_frame(0x0102, 0x0304, true), [1, 2, 3, 4, 1]);
    }

    #[test]
    fn test_role_serializes_snake_case() {
        let json = serde_json::to_string(&CharacteristicRole::IntentionEntry).unwrap();
        assert_eq!(json, "\"intention_entry\"");
    }
}
