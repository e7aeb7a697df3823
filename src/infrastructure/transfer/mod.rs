//! Bulk Transfer Module
//!
//! Direction-agnostic chunked transfer over the file-system characteristic
//! set. A [`BulkProtocol`] supplies one feature's opcode and status
//! vocabulary; [`BulkTransferEngine`] runs the shared machinery:
//!
//! - [`download`] - pull (NEXT request) or push model, idle-round and
//!   no-progress termination, trimmed finalization
//! - [`upload`] - credit-gated chunks with a CRC-32 trailer, adaptive
//!   chunk size, bounded write retry
//! - [`session`] - per-transfer accounting, chunk sizing and credits

pub mod download;
pub mod session;
pub mod upload;

use crate::domain::models::SessionEvent;
use crate::error::{AbortReason, DeviceError, Result};
use crate::infrastructure::bluetooth::connection::Bindings;
use crate::infrastructure::bluetooth::protocol::CharacteristicRole;
use crate::infrastructure::bluetooth::service::DeviceSession;
use crate::infrastructure::bluetooth::transport::{TransportError, TransportEvent, WriteMode};
use session::{AbortHandle, ChunkLimits, TransferSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub use download::{DownloadEnd, DownloadOutcome};
pub use upload::UploadOutcome;

/// Waits and limits shared by every bulk transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTiming {
    /// How long one download round waits for new bytes
    pub download_round: Duration,
    pub download_poll: Duration,
    /// Consecutive rounds without new bytes before a download ends
    pub idle_round_cap: u32,
    pub iteration_cap: u32,
    /// No progress at all for this long aborts the transfer
    pub progress_timeout: Duration,
    /// No credit for this long halves the upload chunk
    pub credit_stall: Duration,
    pub credit_poll: Duration,
    pub initial_credit_timeout: Duration,
    pub chunk_write_attempts: u32,
    pub chunk_retry_delay: Duration,
    /// A credit newer than this lets the chunk grow
    pub fast_credit_window: Duration,
    pub control_busy_retries: u32,
    pub control_busy_delay: Duration,
    /// Listing ends after this much silence following the first reply
    pub list_quiet: Duration,
    pub list_timeout: Duration,
}

impl Default for TransferTiming {
    fn default() -> Self {
        Self {
            download_round: Duration::from_millis(650),
            download_poll: Duration::from_millis(16),
            idle_round_cap: 5,
            iteration_cap: 1200,
            progress_timeout: Duration::from_secs(30),
            credit_stall: Duration::from_secs(2),
            credit_poll: Duration::from_millis(10),
            initial_credit_timeout: Duration::from_secs(30),
            chunk_write_attempts: 3,
            chunk_retry_delay: Duration::from_millis(20),
            fast_credit_window: Duration::from_millis(300),
            control_busy_retries: 6,
            control_busy_delay: Duration::from_millis(90),
            list_quiet: Duration::from_millis(400),
            list_timeout: Duration::from_secs(3),
        }
    }
}

/// A notification interpreted by a [`BulkProtocol`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkSignal {
    SizeAnnounced(usize),
    Data { bytes: Vec<u8>, last: bool },
    Complete,
    Closed,
    Credits(u32),
    Ack,
    Info(Vec<u8>),
    Failed(AbortReason),
    Disconnected,
}

/// One feature's opcode vocabulary over the shared bulk machinery.
pub trait BulkProtocol: Send + Sync {
    fn label(&self) -> &'static str;

    /// Signals carried by one bulk-status notification.
    fn status_signals(&self, value: &[u8]) -> Vec<BulkSignal>;

    fn data_signal(&self, value: &[u8]) -> Option<BulkSignal>;

    fn info_signal(&self, value: &[u8]) -> Option<BulkSignal> {
        Some(BulkSignal::Info(value.to_vec()))
    }

    /// Whether this info payload ends a listing.
    fn info_complete(&self, _value: &[u8]) -> bool {
        false
    }

    /// Pull request for the next chunk; `None` when the device pushes.
    fn next_frame(&self) -> Option<Vec<u8>>;

    fn close_frame(&self) -> Option<Vec<u8>>;

    fn data_opcode(&self) -> u8;

    fn done_frame(&self) -> Vec<u8>;

    /// Sent when an upload is abandoned midway.
    fn upload_abort_frame(&self) -> Option<Vec<u8>> {
        None
    }
}

/// UUIDs of the file-system characteristic set for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkChannels {
    pub control: Uuid,
    pub data: Uuid,
    pub status: Uuid,
    pub info: Option<Uuid>,
}

impl BulkChannels {
    pub fn resolve(bindings: &Bindings) -> Result<Self> {
        Ok(Self {
            control: bindings.require(CharacteristicRole::FsControl)?,
            data: bindings.require(CharacteristicRole::FsData)?,
            status: bindings.require(CharacteristicRole::FsStatus)?,
            info: bindings.get(CharacteristicRole::FsInfo),
        })
    }
}

/// Turns raw transport events into protocol signals without blocking.
pub struct SignalPump<'a, P> {
    events: broadcast::Receiver<TransportEvent>,
    channels: BulkChannels,
    protocol: &'a P,
}

impl<P: BulkProtocol> SignalPump<'_, P> {
    pub fn drain(&mut self) -> Vec<BulkSignal> {
        let mut signals = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(TransportEvent::Notification { uuid, value }) => {
                    if uuid == self.channels.status {
                        signals.extend(self.protocol.status_signals(&value));
                    } else if uuid == self.channels.data {
                        signals.extend(self.protocol.data_signal(&value));
                    } else if Some(uuid) == self.channels.info {
                        signals.extend(self.protocol.info_signal(&value));
                    }
                }
                Ok(TransportEvent::Disconnected) | Err(TryRecvError::Closed) => {
                    signals.push(BulkSignal::Disconnected);
                    break;
                }
                Err(TryRecvError::Lagged(n)) => {
                    warn!("{} signal pump lagged by {} events", self.protocol.label(), n)
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        signals
    }
}

pub struct BulkTransferEngine<P> {
    session: Arc<DeviceSession>,
    protocol: P,
    timing: TransferTiming,
    limits: ChunkLimits,
    abort: AbortHandle,
}

impl<P: BulkProtocol> BulkTransferEngine<P> {
    pub fn new(
        session: Arc<DeviceSession>,
        protocol: P,
        timing: TransferTiming,
        limits: ChunkLimits,
    ) -> Self {
        Self {
            session,
            protocol,
            timing,
            limits,
            abort: AbortHandle::new(),
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn timing(&self) -> &TransferTiming {
        &self.timing
    }

    pub fn limits(&self) -> ChunkLimits {
        self.limits
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Handle the owner keeps to cancel a running transfer.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn channels(&self) -> Result<BulkChannels> {
        BulkChannels::resolve(&self.session.connection().bindings())
    }

    /// Subscribe before writing so early replies are not lost.
    pub fn pump(&self, channels: BulkChannels) -> SignalPump<'_, P> {
        SignalPump {
            events: self.session.transport().events(),
            channels,
            protocol: &self.protocol,
        }
    }

    /// Control write that rides out a busy GATT queue and re-binds once
    /// on a stale handle.
    pub async fn write_control(&self, frame: &[u8], label: &str) -> Result<()> {
        let retries = self.timing.control_busy_retries.max(1);
        let mut attempt = 0u32;
        let mut rebound = false;
        loop {
            let control = self.channels()?.control;
            match self
                .session
                .transport()
                .write(control, frame, WriteMode::WithResponse)
                .await
            {
                Ok(()) => {
                    trace!(bytes = frame.len(), "{} written", label);
                    return Ok(());
                }
                Err(e) if e.is_busy() && attempt + 1 < retries => {
                    attempt += 1;
                    let delay = self.timing.control_busy_delay * attempt;
                    debug!("{} busy, retry {} in {} ms", label, attempt, delay.as_millis());
                    sleep(delay).await;
                }
                Err(TransportError::CharacteristicNotFound(_)) if !rebound => {
                    warn!("{} hit a stale handle, re-binding", label);
                    rebound = true;
                    self.session.reacquire().await?;
                }
                Err(e) => {
                    debug!("{} failed: {}", label, e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Best-effort write; failures are only logged.
    pub(crate) async fn write_quietly(&self, frame: &[u8], label: &str) {
        if let Err(e) = self.write_control(frame, label).await {
            debug!("{} ignored: {}", label, e);
        }
    }

    /// Sends `frame` and gathers info notifications until the protocol
    /// marks the listing complete, the channel goes quiet, or time runs out.
    pub async fn request_info(&self, frame: &[u8], label: &str) -> Result<Vec<Vec<u8>>> {
        let channels = self.channels()?;
        if channels.info.is_none() {
            return Err(DeviceError::CharacteristicMissing(CharacteristicRole::FsInfo));
        }
        let mut pump = self.pump(channels);
        self.write_control(frame, label).await?;

        let started = Instant::now();
        let mut last_reply: Option<Instant> = None;
        let mut replies = Vec::new();
        loop {
            for signal in pump.drain() {
                match signal {
                    BulkSignal::Info(value) => {
                        let done = self.protocol.info_complete(&value);
                        replies.push(value);
                        last_reply = Some(Instant::now());
                        if done {
                            return Ok(replies);
                        }
                    }
                    BulkSignal::Failed(reason) => return Err(DeviceError::abort(label, reason)),
                    BulkSignal::Disconnected => return Err(DeviceError::Disconnected),
                    _ => {}
                }
            }
            if self.abort.is_aborted() {
                return Err(DeviceError::abort(label, AbortReason::Cancelled));
            }
            let quiet = last_reply.is_some_and(|t| t.elapsed() >= self.timing.list_quiet);
            if quiet || started.elapsed() >= self.timing.list_timeout {
                break;
            }
            sleep(self.timing.download_poll).await;
        }
        debug!(replies = replies.len(), "{} finished", label);
        Ok(replies)
    }

    pub(crate) fn report(&self, transfer: &TransferSession) {
        self.session
            .connection()
            .emit(SessionEvent::Transfer(transfer.progress()));
    }
}
