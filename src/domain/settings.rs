use crate::infrastructure::bluetooth::scanner::ScanConfig;
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::protocol::{self, CharacteristicRole};
use crate::infrastructure::bluetooth::robust_io::RetryPolicy;
use crate::infrastructure::bluetooth::service::SessionConfig;
use crate::infrastructure::transfer::session::ChunkLimits;
use crate::infrastructure::transfer::TransferTiming;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "rosary_companion".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Peripheral selection and GATT layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_fs_service_uuid")]
    pub fs_service_uuid: String,
    /// Per-role UUID overrides; roles not listed use the firmware defaults.
    #[serde(default)]
    pub characteristic_overrides: BTreeMap<CharacteristicRole, String>,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_scan_seconds")]
    pub scan_seconds: u64,
    #[serde(default)]
    pub target_device: Option<String>,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            fs_service_uuid: default_fs_service_uuid(),
            characteristic_overrides: BTreeMap::new(),
            name_prefix: default_name_prefix(),
            scan_seconds: default_scan_seconds(),
            target_device: None,
        }
    }
}

fn default_service_uuid() -> String {
    protocol::INFO_SERVICE_UUID.to_string()
}
fn default_fs_service_uuid() -> String {
    protocol::FS_SERVICE_UUID.to_string()
}
fn default_name_prefix() -> String {
    "rosary".to_string()
}
fn default_scan_seconds() -> u64 {
    5
}

/// Handshake, pacing and read-retry timings, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub consent_timeout_ms: u64,
    pub pacing_timeout_ms: u64,
    pub pacing_poll_ms: u64,
    pub read_retries: u32,
    pub read_backoff_ms: u64,
    pub read_backoff_factor: f64,
    pub bind_backoff_ms: u64,
    pub reacquire_settle_ms: u64,
    pub reconnect_pause_ms: u64,
    pub reconnect_settle_ms: u64,
    pub connect_settle_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            consent_timeout_ms: 25_000,
            pacing_timeout_ms: 4_000,
            pacing_poll_ms: 30,
            read_retries: 5,
            read_backoff_ms: 150,
            read_backoff_factor: 1.6,
            bind_backoff_ms: 120,
            reacquire_settle_ms: 200,
            reconnect_pause_ms: 250,
            reconnect_settle_ms: 300,
            connect_settle_ms: 300,
        }
    }
}

/// Bulk-transfer tuning shared by history and wallpaper sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub stall_round_ms: u64,
    pub idle_rounds: u32,
    pub iteration_cap: u32,
    pub progress_timeout_ms: u64,
    pub credit_stall_ms: u64,
    pub credit_poll_ms: u64,
    pub download_poll_ms: u64,
    pub chunk_write_attempts: u32,
    pub chunk_min: usize,
    pub chunk_max: usize,
    pub chunk_step: usize,
    pub fast_credit_window_ms: u64,
    pub mtu: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            stall_round_ms: 650,
            idle_rounds: 5,
            iteration_cap: 1200,
            progress_timeout_ms: 30_000,
            credit_stall_ms: 2_000,
            credit_poll_ms: 10,
            download_poll_ms: 16,
            chunk_write_attempts: 3,
            chunk_min: 40,
            chunk_max: 200,
            chunk_step: 16,
            fast_credit_window_ms: 300,
            mtu: 517,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub known_devices: Vec<String>,
    #[serde(default)]
    pub last_device: Option<String>,
}

impl Settings {
    pub fn connection_config(&self) -> anyhow::Result<ConnectionConfig> {
        let mut characteristics = protocol::default_characteristics();
        for (role, raw) in &self.ble.characteristic_overrides {
            let uuid = protocol::parse_uuid(raw)
                .map_err(|e| anyhow::anyhow!("UUID override for {role}: {e}"))?;
            characteristics.insert(*role, uuid);
        }
        let t = &self.timing;
        Ok(ConnectionConfig {
            name_prefix: self.ble.name_prefix.clone(),
            characteristics,
            bind_retry: RetryPolicy::new(
                t.read_retries,
                Duration::from_millis(t.bind_backoff_ms),
                t.read_backoff_factor,
            ),
            reacquire_settle: Duration::from_millis(t.reacquire_settle_ms),
            reconnect_pause: Duration::from_millis(t.reconnect_pause_ms),
            reconnect_settle: Duration::from_millis(t.reconnect_settle_ms),
        })
    }

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let t = &self.timing;
        Ok(SessionConfig {
            connection: self.connection_config()?,
            read_retry: RetryPolicy::new(
                t.read_retries,
                Duration::from_millis(t.read_backoff_ms),
                t.read_backoff_factor,
            ),
            consent_timeout: Duration::from_millis(t.consent_timeout_ms),
            pacing_timeout: Duration::from_millis(t.pacing_timeout_ms),
            pacing_poll: Duration::from_millis(t.pacing_poll_ms),
            connect_settle: Duration::from_millis(t.connect_settle_ms),
        })
    }

    pub fn scan_config(&self) -> anyhow::Result<ScanConfig> {
        Ok(ScanConfig {
            services: vec![
                protocol::parse_uuid(&self.ble.service_uuid)?,
                protocol::parse_uuid(&self.ble.fs_service_uuid)?,
            ],
            name_prefix: self.ble.name_prefix.clone(),
            scan_duration: Duration::from_secs(self.ble.scan_seconds),
            target: self
                .ble
                .target_device
                .clone()
                .or_else(|| self.last_device.clone()),
        })
    }

    pub fn transfer_timing(&self) -> TransferTiming {
        let t = &self.transfer;
        TransferTiming {
            download_round: Duration::from_millis(t.stall_round_ms),
            download_poll: Duration::from_millis(t.download_poll_ms),
            idle_round_cap: t.idle_rounds,
            iteration_cap: t.iteration_cap,
            progress_timeout: Duration::from_millis(t.progress_timeout_ms),
            credit_stall: Duration::from_millis(t.credit_stall_ms),
            credit_poll: Duration::from_millis(t.credit_poll_ms),
            chunk_write_attempts: t.chunk_write_attempts,
            fast_credit_window: Duration::from_millis(t.fast_credit_window_ms),
            ..TransferTiming::default()
        }
    }

    pub fn chunk_limits(&self) -> ChunkLimits {
        let t = &self.transfer;
        ChunkLimits::new(t.chunk_min, t.chunk_max, t.chunk_step)
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Loads from an explicit file, falling back to defaults when it is absent or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
                Settings::default()
            }
        };
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RosaryCompanion");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_device(&mut self, id: &str) -> anyhow::Result<()> {
        if !self.settings.known_devices.iter().any(|d| d == id) {
            self.settings.known_devices.push(id.to_string());
        }
        self.settings.last_device = Some(id.to_string());
        self.save()
    }
}
