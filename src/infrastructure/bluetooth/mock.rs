//! Scripted in-memory peripheral.
//!
//! `MockTransport` implements [`GattTransport`] without any radio. Tests
//! script read results, inject write failures and notifications, and attach
//! write hooks that answer like firmware would.

use super::protocol::{self, CharacteristicRole};
use super::transport::{
    GattTransport, PeripheralInfo, TransportError, TransportEvent, WriteMode, EVENT_CAPACITY,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

/// Answers a write with notifications. Hooks run outside the mock's lock,
/// but must not block.
pub type WriteHook = Box<dyn FnMut(Uuid, &[u8]) -> Vec<TransportEvent> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub uuid: Uuid,
    pub value: Vec<u8>,
    pub mode: WriteMode,
    pub at: Instant,
}

struct MockState {
    id: String,
    name: Option<String>,
    matched_service: bool,
    characteristics: Vec<Uuid>,
    connected: bool,
    opens: usize,
    closes: usize,
    discovers: usize,
    open_failures: u32,
    discover_failures: u32,
    values: HashMap<Uuid, Vec<u8>>,
    read_script: HashMap<Uuid, VecDeque<Result<Vec<u8>, String>>>,
    reads: HashMap<Uuid, usize>,
    write_failures: HashMap<Uuid, u32>,
    writes: Vec<WriteRecord>,
    subscriptions: HashSet<Uuid>,
    auto_ready: bool,
    hello_reply: Option<u8>,
    keys_reply: Option<u8>,
    hooks: Vec<WriteHook>,
}

#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<TransportEvent>,
}

fn uuid_of(role: CharacteristicRole) -> Uuid {
    protocol::default_characteristics()
        .get(&role)
        .copied()
        .unwrap_or_else(Uuid::nil)
}

impl MockTransport {
    /// A peripheral with no characteristics, advertising under `name`.
    pub fn new(name: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MockState {
                id: "mock-rosary-01".to_string(),
                name: Some(name.to_string()),
                matched_service: true,
                characteristics: Vec::new(),
                connected: false,
                opens: 0,
                closes: 0,
                discovers: 0,
                open_failures: 0,
                discover_failures: 0,
                values: HashMap::new(),
                read_script: HashMap::new(),
                reads: HashMap::new(),
                write_failures: HashMap::new(),
                writes: Vec::new(),
                subscriptions: HashSet::new(),
                auto_ready: false,
                hello_reply: None,
                keys_reply: None,
                hooks: Vec::new(),
            })),
            events,
        }
    }

    /// Every firmware characteristic present, consent granted, and a ready
    /// byte after each control write.
    pub fn rosary() -> Self {
        Self::new("Rosary-01")
            .with_roles(CharacteristicRole::ALL)
            .with_auto_ready()
            .with_hello_reply(protocol::status::CONSENT_GRANTED)
            .with_keys_reply(protocol::status::KEYS_GRANTED)
    }

    pub fn with_roles(self, roles: impl IntoIterator<Item = CharacteristicRole>) -> Self {
        self.with_characteristics(roles.into_iter().map(uuid_of))
    }

    pub fn with_characteristics(self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        {
            let mut state = self.state();
            for uuid in uuids {
                if !state.characteristics.contains(&uuid) {
                    state.characteristics.push(uuid);
                }
            }
        }
        self
    }

    pub fn without_role(self, role: CharacteristicRole) -> Self {
        let uuid = uuid_of(role);
        self.state().characteristics.retain(|u| *u != uuid);
        self
    }

    /// Found by name only, as when no service filter was available.
    pub fn without_service_match(self) -> Self {
        self.state().matched_service = false;
        self
    }

    pub fn with_auto_ready(self) -> Self {
        self.state().auto_ready = true;
        self
    }

    /// Status byte sent in answer to the dashboard HELLO; `None` stays silent.
    pub fn with_hello_reply(self, reply: u8) -> Self {
        self.state().hello_reply = Some(reply);
        self
    }

    pub fn without_hello_reply(self) -> Self {
        self.state().hello_reply = None;
        self
    }

    pub fn with_keys_reply(self, reply: u8) -> Self {
        self.state().keys_reply = Some(reply);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uuid(role: CharacteristicRole) -> Uuid {
        uuid_of(role)
    }

    pub fn set_value(&self, role: CharacteristicRole, value: impl Into<Vec<u8>>) {
        self.state().values.insert(uuid_of(role), value.into());
    }

    /// Queues one read outcome; queued outcomes win over the stored value.
    pub fn push_read(&self, role: CharacteristicRole, result: Result<Vec<u8>, &str>) {
        self.state()
            .read_script
            .entry(uuid_of(role))
            .or_default()
            .push_back(result.map_err(str::to_string));
    }

    pub fn fail_next_writes(&self, role: CharacteristicRole, count: u32) {
        self.state().write_failures.insert(uuid_of(role), count);
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.state().open_failures = count;
    }

    pub fn fail_next_discovers(&self, count: u32) {
        self.state().discover_failures = count;
    }

    pub fn on_write<F>(&self, hook: F)
    where
        F: FnMut(Uuid, &[u8]) -> Vec<TransportEvent> + Send + 'static,
    {
        self.state().hooks.push(Box::new(hook));
    }

    pub fn notify(&self, role: CharacteristicRole, value: impl Into<Vec<u8>>) {
        let _ = self.events.send(TransportEvent::Notification {
            uuid: uuid_of(role),
            value: value.into(),
        });
    }

    /// The peer drops the link.
    pub fn drop_link(&self) {
        self.state().connected = false;
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    pub fn writes_to(&self, role: CharacteristicRole) -> Vec<Vec<u8>> {
        let uuid = uuid_of(role);
        self.state()
            .writes
            .iter()
            .filter(|w| w.uuid == uuid)
            .map(|w| w.value.clone())
            .collect()
    }

    pub fn read_count(&self, role: CharacteristicRole) -> usize {
        self.state().reads.get(&uuid_of(role)).copied().unwrap_or(0)
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    pub fn discover_count(&self) -> usize {
        self.state().discovers
    }

    pub fn is_subscribed(&self, role: CharacteristicRole) -> bool {
        self.state().subscriptions.contains(&uuid_of(role))
    }

    fn firmware_reply(state: &MockState, uuid: Uuid, value: &[u8]) -> Option<TransportEvent> {
        let control = uuid_of(CharacteristicRole::Control);
        let auth = uuid_of(CharacteristicRole::AuthControl);
        if uuid != control && uuid != auth {
            return None;
        }
        let byte = match value.first() {
            Some(&protocol::opcode::HELLO) if value.len() == 1 => state.hello_reply?,
            Some(&protocol::opcode::KEYS_HELLO) => state.keys_reply?,
            _ if state.auto_ready => protocol::status::READY,
            _ => return None,
        };
        Some(TransportEvent::Notification {
            uuid: uuid_of(CharacteristicRole::Status),
            value: vec![byte],
        })
    }

    fn check_known(state: &MockState, uuid: Uuid) -> Result<(), TransportError> {
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if !state.characteristics.contains(&uuid) {
            return Err(TransportError::CharacteristicNotFound(uuid));
        }
        Ok(())
    }
}

#[async_trait]
impl GattTransport for MockTransport {
    async fn open(&self) -> Result<PeripheralInfo, TransportError> {
        let mut state = self.state();
        state.opens += 1;
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(TransportError::Io("mock: connect refused".into()));
        }
        state.connected = true;
        Ok(PeripheralInfo {
            id: state.id.clone(),
            name: state.name.clone(),
            matched_service: state.matched_service,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        let was_connected = {
            let mut state = self.state();
            state.closes += 1;
            state.subscriptions.clear();
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn discover(&self) -> Result<Vec<Uuid>, TransportError> {
        let mut state = self.state();
        state.discovers += 1;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.discover_failures > 0 {
            state.discover_failures -= 1;
            return Err(TransportError::Io("mock: discovery failed".into()));
        }
        Ok(state.characteristics.clone())
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        Self::check_known(&state, uuid)?;
        *state.reads.entry(uuid).or_insert(0) += 1;
        if let Some(next) = state.read_script.get_mut(&uuid).and_then(VecDeque::pop_front) {
            return next.map_err(TransportError::Io);
        }
        Ok(state.values.get(&uuid).cloned().unwrap_or_default())
    }

    async fn write(
        &self,
        uuid: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let (mut hooks, reply) = {
            let mut state = self.state();
            Self::check_known(&state, uuid)?;
            if let Some(left) = state.write_failures.get_mut(&uuid) {
                if *left > 0 {
                    *left -= 1;
                    return Err(TransportError::Io("mock: GATT write failed".into()));
                }
            }
            state.writes.push(WriteRecord {
                uuid,
                value: value.to_vec(),
                mode,
                at: Instant::now(),
            });
            let reply = Self::firmware_reply(&state, uuid, value);
            (std::mem::take(&mut state.hooks), reply)
        };

        let mut emitted: Vec<TransportEvent> = reply.into_iter().collect();
        for hook in hooks.iter_mut() {
            emitted.extend(hook(uuid, value));
        }

        {
            let mut state = self.state();
            hooks.append(&mut state.hooks);
            state.hooks = hooks;
        }
        for event in emitted {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        let mut state = self.state();
        Self::check_known(&state, uuid)?;
        state.subscriptions.insert(uuid);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
