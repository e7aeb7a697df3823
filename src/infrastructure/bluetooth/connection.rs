//! BLE Connection Module
//!
//! Opens the transport, validates the peripheral, binds characteristics by
//! role and watches the link. A peer-initiated drop and a local disconnect
//! both end in exactly one `SessionEvent::Disconnected`.

use crate::domain::models::{LinkState, MessageSeverity, SessionEvent, StatusMessage};
use crate::error::{DeviceError, Result};
use crate::infrastructure::bluetooth::protocol::{self, CharacteristicRole};
use crate::infrastructure::bluetooth::robust_io::{with_retry, RetryPolicy};
use crate::infrastructure::bluetooth::scanner;
use crate::infrastructure::bluetooth::transport::{GattTransport, PeripheralInfo, TransportEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Expected advertised-name prefix when the peripheral was not found by service
    pub name_prefix: String,
    /// UUID bound for each role
    pub characteristics: HashMap<CharacteristicRole, Uuid>,
    /// Retry policy for discovery and notification subscription
    pub bind_retry: RetryPolicy,
    /// Pause before re-binding characteristics
    pub reacquire_settle: Duration,
    /// Pause between closing and reopening during a forced reconnect
    pub reconnect_pause: Duration,
    /// Pause after reopening, before re-binding
    pub reconnect_settle: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name_prefix: "rosary".to_string(),
            characteristics: protocol::default_characteristics(),
            bind_retry: RetryPolicy::bindings(),
            reacquire_settle: Duration::from_millis(200),
            reconnect_pause: Duration::from_millis(250),
            reconnect_settle: Duration::from_millis(300),
        }
    }
}

/// Roles bound to the current GATT handles, plus the optional ones found absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    bound: HashMap<CharacteristicRole, Uuid>,
    absent: Vec<CharacteristicRole>,
}

impl Bindings {
    pub fn get(&self, role: CharacteristicRole) -> Option<Uuid> {
        self.bound.get(&role).copied()
    }

    pub fn require(&self, role: CharacteristicRole) -> Result<Uuid> {
        self.get(role)
            .ok_or(DeviceError::CharacteristicMissing(role))
    }

    pub fn is_bound(&self, role: CharacteristicRole) -> bool {
        self.bound.contains_key(&role)
    }

    pub fn absent(&self) -> &[CharacteristicRole] {
        &self.absent
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn GattTransport>,
    config: ConnectionConfig,
    bindings: RwLock<Bindings>,
    peripheral: Mutex<Option<PeripheralInfo>>,
    link: watch::Sender<LinkState>,
    disconnect_emitted: AtomicBool,
    reconnecting: AtomicBool,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn GattTransport>,
        config: ConnectionConfig,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let (link, _) = watch::channel(LinkState::Disconnected);
        Arc::new(Self {
            transport,
            config,
            bindings: RwLock::new(Bindings::default()),
            peripheral: Mutex::new(None),
            link,
            disconnect_emitted: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            event_sender,
            watcher: Mutex::new(None),
        })
    }

    /// Opens the link and binds the mandatory control/status pair.
    pub async fn connect(self: &Arc<Self>) -> Result<PeripheralInfo> {
        info!("Connecting to Rosary device");
        self.send_log("Connecting to device...", MessageSeverity::Info);
        self.link.send_replace(LinkState::Connecting);

        // Step 1: open the transport
        let info = match self.transport.open().await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to open transport: {}", e);
                self.link.send_replace(LinkState::Disconnected);
                return Err(DeviceError::Connection(format!("could not open link: {e}")));
            }
        };
        info!(id = %info.id, name = ?info.name, "Transport open");

        // Step 2: without a service match the name must identify the family
        if !info.matched_service
            && !scanner::matches_family(info.name.as_deref(), &self.config.name_prefix)
        {
            warn!("Rejecting peripheral {:?}: not a Rosary device", info.name);
            let _ = self.transport.close().await;
            self.link.send_replace(LinkState::Disconnected);
            self.send_log("Please pick your Rosary device", MessageSeverity::Error);
            return Err(DeviceError::Connection(format!(
                "'{}' is not a Rosary device",
                info.name.as_deref().unwrap_or("unnamed peripheral")
            )));
        }

        self.disconnect_emitted.store(false, Ordering::SeqCst);
        *self.peripheral.lock().unwrap_or_else(PoisonError::into_inner) = Some(info.clone());
        self.spawn_watcher();

        // Step 3: control and status are required before anything else
        if let Err(e) = self
            .bind(&[CharacteristicRole::Control, CharacteristicRole::Status])
            .await
        {
            self.disconnect().await;
            return Err(e);
        }

        self.link.send_replace(LinkState::Connected);
        Ok(info)
    }

    /// Binds every configured role. Missing optional roles are recorded as absent.
    pub async fn bind_all(&self) -> Result<Bindings> {
        self.bind(&CharacteristicRole::ALL).await
    }

    /// Re-binds all characteristics on the existing link.
    pub async fn reacquire(&self) -> Result<Bindings> {
        info!("Re-acquiring characteristics");
        sleep(self.config.reacquire_settle).await;
        self.bind_all().await
    }

    async fn bind(&self, roles: &[CharacteristicRole]) -> Result<Bindings> {
        let policy = self.config.bind_retry;
        let found: HashSet<Uuid> = with_retry(&policy, "service discovery", || {
            self.transport.discover()
        })
        .await
        .map_err(|e| DeviceError::Connection(format!("service discovery failed: {e}")))?
        .into_iter()
        .collect();

        let mut bindings = Bindings::default();
        for &role in roles {
            let Some(uuid) = self.config.characteristics.get(&role).copied() else {
                bindings.absent.push(role);
                continue;
            };

            if !found.contains(&uuid) {
                if role.is_mandatory() {
                    error!("Mandatory {} characteristic not found", role);
                    return Err(DeviceError::Connection(format!(
                        "{role} characteristic not found"
                    )));
                }
                debug!("Optional {} characteristic absent", role);
                bindings.absent.push(role);
                continue;
            }

            if role.notifies() {
                let label = format!("subscribe {role}");
                if let Err(e) = with_retry(&policy, &label, || self.transport.subscribe(uuid)).await {
                    if role.is_mandatory() {
                        return Err(DeviceError::Connection(format!(
                            "could not enable {role} notifications: {e}"
                        )));
                    }
                    warn!("Notifications on {} unavailable: {}", role, e);
                }
            }
            bindings.bound.insert(role, uuid);
        }

        info!(
            bound = bindings.bound.len(),
            absent = ?bindings.absent,
            "Characteristics bound"
        );
        *self.bindings.write().unwrap_or_else(PoisonError::into_inner) = bindings.clone();
        Ok(bindings)
    }

    /// Closes, reopens and re-binds the link.
    pub async fn reconnect(&self) -> Result<()> {
        warn!("Forcing reconnect");
        self.reconnecting.store(true, Ordering::SeqCst);
        self.link.send_replace(LinkState::Reconnecting);

        let result = async {
            if let Err(e) = self.transport.close().await {
                debug!("Close before reconnect failed: {}", e);
            }
            sleep(self.config.reconnect_pause).await;
            self.transport.open().await?;
            sleep(self.config.reconnect_settle).await;
            self.bind_all().await?;
            Ok::<(), DeviceError>(())
        }
        .await;

        self.reconnecting.store(false, Ordering::SeqCst);
        match &result {
            Ok(()) => {
                info!("Reconnected");
                self.link.send_replace(LinkState::Connected);
            }
            Err(e) => {
                error!("Reconnect failed: {}", e);
                self.mark_disconnected();
            }
        }
        result
    }

    /// Closes the link; the disconnected signal fires once.
    pub async fn disconnect(&self) {
        info!("Disconnecting");
        if let Err(e) = self.transport.close().await {
            warn!("Transport close failed: {}", e);
        }
        self.mark_disconnected();
    }

    fn mark_disconnected(&self) {
        self.link.send_replace(LinkState::Disconnected);
        if !self.disconnect_emitted.swap(true, Ordering::SeqCst) {
            info!("Device disconnected");
            let _ = self.event_sender.send(SessionEvent::Disconnected);
            self.send_log("Disconnected", MessageSeverity::Warning);
        }
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let mut events = self.transport.events();
        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Disconnected) => {
                        let Some(manager) = manager.upgrade() else { break };
                        if manager.reconnecting.load(Ordering::SeqCst) {
                            debug!("Link drop during reconnect ignored");
                            continue;
                        }
                        if manager.transport.is_connected().await {
                            debug!("Stale disconnect event ignored");
                            continue;
                        }
                        warn!("Peer dropped the link");
                        manager.mark_disconnected();
                    }
                    Ok(TransportEvent::Notification { .. }) => {}
                    Err(RecvError::Lagged(n)) => debug!("Link watcher lagged by {} events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn transport(&self) -> &Arc<dyn GattTransport> {
        &self.transport
    }

    pub fn bindings(&self) -> Bindings {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn uuid_for(&self, role: CharacteristicRole) -> Result<Uuid> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .require(role)
    }

    pub fn peripheral(&self) -> Option<PeripheralInfo> {
        self.peripheral
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            *self.link.borrow(),
            LinkState::Connected | LinkState::Reconnecting
        )
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Send a log message
    pub fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(SessionEvent::Log(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::MockTransport;

    fn manager(mock: &MockTransport) -> (Arc<ConnectionManager>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(Arc::new(mock.clone()), ConnectionConfig::default(), tx);
        (manager, rx)
    }

    fn disconnects(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::Disconnected) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_binds_mandatory_pair() {
        let mock = MockTransport::rosary();
        let (manager, _rx) = manager(&mock);
        manager.connect().await.unwrap();
        assert!(manager.uuid_for(CharacteristicRole::Control).is_ok());
        assert!(mock.is_subscribed(CharacteristicRole::Status));
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_roles_recorded_absent() {
        let mock = MockTransport::rosary()
            .without_role(CharacteristicRole::Touch)
            .without_role(CharacteristicRole::FsData);
        let (manager, _rx) = manager(&mock);
        manager.connect().await.unwrap();
        let bindings = manager.bind_all().await.unwrap();
        assert!(bindings.absent().contains(&CharacteristicRole::Touch));
        assert!(bindings.absent().contains(&CharacteristicRole::FsData));
        assert!(matches!(
            manager.uuid_for(CharacteristicRole::Touch),
            Err(DeviceError::CharacteristicMissing(CharacteristicRole::Touch))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_status_fails_connect() {
        let mock = MockTransport::rosary().without_role(CharacteristicRole::Status);
        let (manager, _rx) = manager(&mock);
        assert!(matches!(
            manager.connect().await,
            Err(DeviceError::Connection(_))
        ));
        assert!(!mock.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_foreign_name_without_service_match() {
        let mock = MockTransport::new("Headphones")
            .with_roles(CharacteristicRole::ALL)
            .without_service_match();
        let (manager, _rx) = manager(&mock);
        assert!(matches!(
            manager.connect().await,
            Err(DeviceError::Connection(_))
        ));
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_signal_fires_once() {
        let mock = MockTransport::rosary();
        let (manager, mut rx) = manager(&mock);
        manager.connect().await.unwrap();

        mock.drop_link();
        sleep(Duration::from_millis(10)).await;
        manager.disconnect().await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(disconnects(&mut rx), 1);
        assert_eq!(*manager.link_state().borrow(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_does_not_signal_disconnect() {
        let mock = MockTransport::rosary();
        let (manager, mut rx) = manager(&mock);
        manager.connect().await.unwrap();

        manager.reconnect().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(mock.open_count(), 2);
        assert_eq!(disconnects(&mut rx), 0);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_retries_before_failing() {
        let mock = MockTransport::rosary();
        mock.fail_next_discovers(2);
        let (manager, _rx) = manager(&mock);
        manager.connect().await.unwrap();
        assert_eq!(mock.discover_count(), 3);
    }
}
