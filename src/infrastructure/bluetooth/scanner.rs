//! BLE Scanner Module
//!
//! Finds Rosary peripherals: a service-filtered scan first, then an
//! unfiltered scan matched by advertised name.

use crate::infrastructure::bluetooth::transport::TransportError;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Advertised services that identify the device family.
    pub services: Vec<Uuid>,
    pub name_prefix: String,
    pub scan_duration: Duration,
    /// Preferred peripheral id, usually the last device connected.
    pub target: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            services: [
                super::protocol::INFO_SERVICE_UUID,
                super::protocol::FS_SERVICE_UUID,
            ]
            .iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect(),
            name_prefix: "rosary".to_string(),
            scan_duration: Duration::from_secs(5),
            target: None,
        }
    }
}

/// Advertisement summary used to rank candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertises_service: bool,
}

pub struct ScannedDevice {
    pub peripheral: Peripheral,
    pub candidate: Candidate,
}

/// Case-insensitive family match on the advertised name, also accepting
/// stacks that wrap the name as `"<host> [Rosary-01]"`.
pub fn matches_family(name: Option<&str>, prefix: &str) -> bool {
    let Some(name) = name else { return false };
    let name = name.trim().to_lowercase();
    let prefix = prefix.to_lowercase();
    !prefix.is_empty() && (name.starts_with(&prefix) || name.contains(&format!("[{prefix}")))
}

/// Picks the best candidate: the requested id, else a service match, else a
/// family-name match; ties go to the strongest signal.
pub fn select_candidate(
    candidates: &[Candidate],
    prefix: &str,
    target: Option<&str>,
) -> Option<usize> {
    if let Some(target) = target {
        if let Some(idx) = candidates
            .iter()
            .position(|c| c.id.eq_ignore_ascii_case(target))
        {
            return Some(idx);
        }
    }

    let strongest = |pred: &dyn Fn(&Candidate) -> bool| {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| pred(c))
            .max_by_key(|(_, c)| c.rssi.unwrap_or(i16::MIN))
            .map(|(idx, _)| idx)
    };

    strongest(&|c| c.advertises_service)
        .or_else(|| strongest(&|c| matches_family(c.name.as_deref(), prefix)))
}

pub struct BleScanner {
    adapter: Adapter,
    config: ScanConfig,
}

impl BleScanner {
    pub fn new(adapter: Adapter, config: ScanConfig) -> Self {
        Self { adapter, config }
    }

    /// First adapter reported by the platform.
    pub async fn default_adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await?;
        manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn scan_once(&self, filter: ScanFilter) -> Result<Vec<ScannedDevice>, TransportError> {
        self.adapter.start_scan(filter).await?;
        sleep(self.config.scan_duration).await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan cleanly: {}", e);
        }

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let advertises_service = props
                .services
                .iter()
                .any(|s| self.config.services.contains(s));
            found.push(ScannedDevice {
                candidate: Candidate {
                    id: peripheral.id().to_string(),
                    name: props.local_name,
                    rssi: props.rssi,
                    advertises_service,
                },
                peripheral,
            });
        }
        Ok(found)
    }

    /// Scans and returns the best match.
    pub async fn select(&self) -> Result<ScannedDevice, TransportError> {
        info!(
            "Scanning {}s for Rosary devices",
            self.config.scan_duration.as_secs()
        );
        let mut devices = self
            .scan_once(ScanFilter {
                services: self.config.services.clone(),
            })
            .await?;

        if devices.is_empty() {
            warn!("Service-filtered scan found nothing, retrying by name");
            devices = self.scan_once(ScanFilter::default()).await?;
        }

        let candidates: Vec<Candidate> = devices.iter().map(|d| d.candidate.clone()).collect();
        let idx = select_candidate(
            &candidates,
            &self.config.name_prefix,
            self.config.target.as_deref(),
        )
        .ok_or(TransportError::PeripheralNotFound)?;

        let device = devices.swap_remove(idx);
        info!(
            id = %device.candidate.id,
            name = ?device.candidate.name,
            rssi = ?device.candidate.rssi,
            "Selected peripheral"
        );
        Ok(device)
    }
}
