//! Device Session Module
//!
//! Owns one connected peripheral: the connection manager, the pacing gate,
//! the consent flag and robust reads. Created by a successful `connect`,
//! torn down by `disconnect` or a peer drop.

use crate::domain::models::{
    ConsentKind, DeviceInfo, KeyBundle, KeysMode, LinkState, MessageSeverity, SessionEvent,
};
use crate::error::{DeviceError, Result};
use crate::infrastructure::bluetooth::{
    connection::{Bindings, ConnectionConfig, ConnectionManager},
    consent::{ConsentHandshake, CONSENT_TIMEOUT},
    pacing::{self, PacingGate},
    protocol::{self, opcode, CharacteristicRole, KvEntry, KvTable, KvValue},
    robust_io::{RetryPolicy, RobustCharacteristicIo},
    transport::{GattTransport, WriteMode},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub read_retry: RetryPolicy,
    pub consent_timeout: Duration,
    pub pacing_timeout: Duration,
    pub pacing_poll: Duration,
    /// Pause between consent and binding the full characteristic set
    pub connect_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            read_retry: RetryPolicy::reads(),
            consent_timeout: CONSENT_TIMEOUT,
            pacing_timeout: pacing::DEFAULT_TIMEOUT,
            pacing_poll: pacing::DEFAULT_POLL,
            connect_settle: Duration::from_millis(300),
        }
    }
}

pub struct DeviceSession {
    connection: Arc<ConnectionManager>,
    pacing: Arc<PacingGate>,
    io: RobustCharacteristicIo,
    consent: AtomicBool,
    config: SessionConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceSession {
    /// Connects, negotiates dashboard consent and binds every characteristic.
    pub async fn connect(
        transport: Arc<dyn GattTransport>,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let connection =
            ConnectionManager::new(transport, config.connection.clone(), event_sender);
        connection.connect().await?;

        let status = connection.uuid_for(CharacteristicRole::Status)?;
        let pacing = Arc::new(PacingGate::new(config.pacing_poll, config.pacing_timeout));
        let tasks = vec![
            pacing.spawn_listener(connection.transport().events(), status),
            spawn_invalidator(connection.link_state(), Arc::downgrade(&pacing)),
        ];

        let session = Self {
            io: RobustCharacteristicIo::new(connection.clone(), config.read_retry),
            connection,
            pacing,
            consent: AtomicBool::new(false),
            config,
            tasks,
        };

        if let Err(e) = session.establish().await {
            session.connection.disconnect().await;
            return Err(e);
        }

        let info = session.device_info();
        info!(id = %info.id, file_system = info.file_system, "Session ready");
        session.connection.emit(SessionEvent::Connected(info));
        session
            .connection
            .send_log("Connection established!", MessageSeverity::Success);
        Ok(session)
    }

    async fn establish(&self) -> Result<()> {
        if !self.run_consent(ConsentKind::Dashboard).await? {
            self.connection
                .send_log("Consent denied on the device", MessageSeverity::Error);
            return Err(DeviceError::ConsentDenied(ConsentKind::Dashboard));
        }
        sleep(self.config.connect_settle).await;
        self.connection.bind_all().await?;
        Ok(())
    }

    async fn run_consent(&self, kind: ConsentKind) -> Result<bool> {
        if kind == ConsentKind::Dashboard {
            self.consent.store(false, Ordering::SeqCst);
        }
        let bindings = self.connection.bindings();
        let granted = ConsentHandshake::new(
            self.connection.transport().as_ref(),
            bindings.require(CharacteristicRole::Control)?,
            bindings.require(CharacteristicRole::Status)?,
        )
        .with_timeout(self.config.consent_timeout)
        .run(kind)
        .await?;
        if kind == ConsentKind::Dashboard {
            self.consent.store(granted, Ordering::SeqCst);
        }
        Ok(granted)
    }

    /// Repeats the dashboard handshake; prior consent is dropped first.
    pub async fn request_consent_again(&self) -> Result<()> {
        if self.run_consent(ConsentKind::Dashboard).await? {
            Ok(())
        } else {
            Err(DeviceError::ConsentDenied(ConsentKind::Dashboard))
        }
    }

    pub fn has_consent(&self) -> bool {
        self.consent.load(Ordering::SeqCst)
    }

    pub fn device_info(&self) -> DeviceInfo {
        let bindings = self.connection.bindings();
        let peripheral = self.connection.peripheral();
        DeviceInfo {
            id: peripheral.as_ref().map(|p| p.id.clone()).unwrap_or_default(),
            name: peripheral.and_then(|p| p.name),
            consent: self.has_consent(),
            file_system: [
                CharacteristicRole::FsControl,
                CharacteristicRole::FsData,
                CharacteristicRole::FsStatus,
            ]
            .iter()
            .all(|r| bindings.is_bound(*r)),
            remote_touch: bindings.is_bound(CharacteristicRole::Touch),
            remote_keys: bindings.is_bound(CharacteristicRole::Keys),
            key_store: bindings.is_bound(CharacteristicRole::AuthInfo)
                && bindings.is_bound(CharacteristicRole::AuthControl),
        }
    }

    /// Writes a paced command and waits for the device to signal ready.
    ///
    /// A `PacingTimeout` leaves the gate closed; the next call clears it
    /// again and writes without waiting for the missed ready.
    pub async fn paced_write(&self, role: CharacteristicRole, frame: &[u8]) -> Result<()> {
        let uuid = self.connection.uuid_for(role)?;
        self.pacing.clear();
        self.connection
            .transport()
            .write(uuid, frame, WriteMode::WithResponse)
            .await?;
        self.pacing.acquire_default().await
    }

    pub async fn set_pref(&self, key: &str, value: KvValue) -> Result<()> {
        debug!(key, "SET_PREF");
        let frame = protocol::pack_kv(opcode::SET_PREF, key, &value)?;
        self.paced_write(CharacteristicRole::Control, &frame).await
    }

    pub async fn set_stat(&self, key: &str, value: KvValue) -> Result<()> {
        debug!(key, "SET_STAT");
        let frame = protocol::pack_kv(opcode::SET_STAT, key, &value)?;
        self.paced_write(CharacteristicRole::Control, &frame).await
    }

    /// Replays a backup: RESTORE_BEGIN, one paced SET per entry, RESTORE_DONE.
    /// `progress` receives `(done, total)` after every entry.
    pub async fn restore_values<F>(&self, entries: &[KvEntry], mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let total_bytes: usize = entries.iter().map(KvEntry::payload_len).sum();
        info!(
            entries = entries.len(),
            bytes = total_bytes,
            "Restoring device values"
        );
        let begin = protocol::restore_begin_frame(entries.len(), total_bytes)?;
        match self.paced_write(CharacteristicRole::Control, &begin).await {
            // Older firmware does not acknowledge RESTORE_BEGIN.
            Err(DeviceError::PacingTimeout { .. }) => warn!("No ready after RESTORE_BEGIN"),
            other => other?,
        }

        for (done, entry) in entries.iter().enumerate() {
            let table = match entry.table {
                KvTable::Pref => "pref",
                KvTable::Stat => "stat",
            };
            debug!(key = %entry.key, table, "Restoring value");
            self.paced_write(CharacteristicRole::Control, &entry.frame()?)
                .await?;
            progress(done + 1, entries.len());
        }

        self.paced_write(CharacteristicRole::Control, &[opcode::RESTORE_DONE])
            .await?;
        self.connection
            .send_log("Restore complete", MessageSeverity::Success);
        Ok(())
    }

    pub async fn request_keys_consent(&self, mode: KeysMode) -> Result<()> {
        let kind = ConsentKind::from(mode);
        if self.run_consent(kind).await? {
            Ok(())
        } else {
            Err(DeviceError::ConsentDenied(kind))
        }
    }

    pub async fn export_keys(&self) -> Result<KeyBundle> {
        self.connection.uuid_for(CharacteristicRole::AuthInfo)?;
        self.request_keys_consent(KeysMode::Export).await?;
        let raw = self.io.read(CharacteristicRole::AuthInfo).await?;
        let text = String::from_utf8_lossy(&raw);
        let bundle: KeyBundle = serde_json::from_str(text.trim_end_matches('\0').trim())?;
        if bundle.id.is_empty() || bundle.pub_key.is_empty() || bundle.priv_key.is_empty() {
            return Err(DeviceError::InvalidFrame(
                "device did not return full keys".into(),
            ));
        }
        info!(id = %bundle.id, "Keys exported");
        Ok(bundle)
    }

    pub async fn restore_keys(&self, bundle: &KeyBundle) -> Result<()> {
        self.connection.uuid_for(CharacteristicRole::AuthControl)?;
        self.request_keys_consent(KeysMode::Restore).await?;
        let role = CharacteristicRole::AuthControl;
        self.paced_write(role, &[opcode::AUTH_BEGIN]).await?;
        self.paced_write(role, &protocol::auth_set_frame("id", &bundle.id)?)
            .await?;
        self.paced_write(role, &protocol::auth_set_frame("pubKey", &bundle.pub_key)?)
            .await?;
        self.paced_write(role, &protocol::auth_set_frame("privKey", &bundle.priv_key)?)
            .await?;
        self.paced_write(role, &[opcode::AUTH_COMMIT]).await?;
        info!(id = %bundle.id, "Keys restored");
        Ok(())
    }

    pub async fn send_touch(&self, x: u16, y: u16, down: bool) -> Result<()> {
        self.unpaced_write(CharacteristicRole::Touch, &protocol::touch_frame(x, y, down))
            .await
    }

    pub async fn send_key(&self, code: u8) -> Result<()> {
        self.unpaced_write(CharacteristicRole::Keys, &[code]).await
    }

    /// Write-without-response first, then with response.
    async fn unpaced_write(&self, role: CharacteristicRole, frame: &[u8]) -> Result<()> {
        let uuid = self.connection.uuid_for(role)?;
        let transport = self.connection.transport();
        if let Err(e) = transport
            .write(uuid, frame, WriteMode::WithoutResponse)
            .await
        {
            debug!("Unacknowledged {} write failed ({}), retrying with response", role, e);
            transport.write(uuid, frame, WriteMode::WithResponse).await?;
        }
        Ok(())
    }

    pub async fn read(&self, role: CharacteristicRole) -> Result<Vec<u8>> {
        self.io.read(role).await
    }

    pub async fn robust_read(&self, role: CharacteristicRole) -> Result<Vec<u8>> {
        self.io.robust_read(role).await
    }

    pub async fn reacquire(&self) -> Result<Bindings> {
        self.connection.reacquire().await
    }

    pub async fn disconnect(&self) {
        self.pacing.invalidate();
        self.connection.disconnect().await;
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn pacing(&self) -> &PacingGate {
        &self.pacing
    }

    pub fn transport(&self) -> &Arc<dyn GattTransport> {
        self.connection.transport()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Fails the pacing gate as soon as the link reports a disconnect.
fn spawn_invalidator(
    mut link: watch::Receiver<LinkState>,
    pacing: Weak<PacingGate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while link.changed().await.is_ok() {
            let state = *link.borrow_and_update();
            let Some(gate) = pacing.upgrade() else { break };
            if state == LinkState::Disconnected {
                debug!("Link down, invalidating pacing gate");
                gate.invalidate();
            }
        }
    })
}
