use anyhow::{anyhow, Context};
use rosary_companion::domain::models::{MessageSeverity, SessionEvent};
use rosary_companion::domain::settings::{Settings, SettingsService};
use rosary_companion::infrastructure::bluetooth::btleplug_transport::BtleplugTransport;
use rosary_companion::infrastructure::logging::init_logger;
use rosary_companion::infrastructure::sync::info::InfoStatus;
use rosary_companion::{Backup, DeviceSession, HistorySync, InfoSync, SyncQueue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting rosary companion");

    let transport = BtleplugTransport::with_default_adapter(settings.scan_config()?)
        .await
        .context("no usable Bluetooth adapter")?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::Connected(device) => info!(?device, "Connected"),
                SessionEvent::Disconnected => warn!("Device disconnected"),
                SessionEvent::Transfer(progress) => {
                    info!(name = %progress.name, percent = ?progress.percent(), "Transfer")
                }
                SessionEvent::Log(message) => match message.severity {
                    MessageSeverity::Error => error!("{}", message.message),
                    MessageSeverity::Warning => warn!("{}", message.message),
                    _ => info!("{}", message.message),
                },
            }
        }
    });

    let session = Arc::new(
        DeviceSession::connect(Arc::new(transport), settings.session_config()?, events_tx)
            .await
            .context("connecting to the rosary")?,
    );
    if let Some(peripheral) = session.connection().peripheral() {
        if let Err(e) = settings_service.remember_device(&peripheral.id) {
            warn!("Could not remember device: {}", e);
        }
    }

    let result = sync_once(session.clone(), &settings).await;
    if let Err(e) = &result {
        error!("Sync failed: {:#}", e);
    }
    session.disconnect().await;
    result
}

/// Reads the info snapshot, sets the clock and backs up the dashboard
/// values and the prayer history.
async fn sync_once(session: Arc<DeviceSession>, settings: &Settings) -> anyhow::Result<()> {
    let backup_dir = dirs::data_dir()
        .context("no data directory")?
        .join("RosaryCompanion");
    std::fs::create_dir_all(&backup_dir)
        .with_context(|| format!("creating {}", backup_dir.display()))?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();

    match InfoSync::new(session.clone()).refresh_until_valid().await? {
        InfoStatus::Ready(snapshot) => {
            let backup = Backup::from_snapshot(&snapshot);
            let path = backup_dir.join(format!("{stamp}-{}", backup.file_name()));
            std::fs::write(&path, backup.to_json()?)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(fw = %backup.fw_version, path = %path.display(), "Device backup written");
        }
        InfoStatus::ConsentRequired => return Err(anyhow!("approve the dashboard on the device")),
        InfoStatus::NotReady => warn!("Device did not return usable info"),
    }

    let history = HistorySync::new(
        session,
        settings.transfer_timing(),
        settings.chunk_limits(),
        SyncQueue::new(),
    );
    history.set_rtc_now().await?;
    let (listing, download) = history.refresh().await?;
    info!(
        files = listing.files.len(),
        bytes = download.outcome.bytes.len(),
        complete = download.outcome.is_complete(),
        summary = ?download.summary,
        "History downloaded"
    );

    let backup = backup_dir.join(format!("history-{stamp}.bin"));
    std::fs::write(&backup, &download.outcome.bytes)
        .with_context(|| format!("writing {}", backup.display()))?;
    info!(path = %backup.display(), "History backup written");
    Ok(())
}
