//! Single-slot pacing permit.
//!
//! The firmware answers every paced control command with a ready byte on the
//! status characteristic. A listener task raises the permit when it sees one;
//! writers consume it before issuing the next paced command.

use super::protocol::status;
use super::transport::TransportEvent;
use crate::error::{DeviceError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub const DEFAULT_POLL: Duration = Duration::from_millis(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(4000);

#[derive(Debug)]
pub struct PacingGate {
    permit: AtomicBool,
    closed: AtomicBool,
    poll: Duration,
    default_timeout: Duration,
}

impl Default for PacingGate {
    fn default() -> Self {
        Self::new(DEFAULT_POLL, DEFAULT_TIMEOUT)
    }
}

impl PacingGate {
    /// A fresh session may send its first command without waiting.
    pub fn new(poll: Duration, default_timeout: Duration) -> Self {
        Self {
            permit: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            poll,
            default_timeout,
        }
    }

    pub fn signal_ready(&self) {
        self.permit.store(true, Ordering::Release);
    }

    /// Marks a paced command as in flight.
    pub fn clear(&self) {
        self.permit.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.permit.load(Ordering::Acquire)
    }

    /// Link lost: pending and future acquires fail with `Disconnected`.
    pub fn invalidate(&self) {
        self.closed.store(true, Ordering::Release);
        self.permit.store(false, Ordering::Release);
    }

    /// Re-arms the gate after a successful reconnect.
    pub fn reset(&self) {
        self.closed.store(false, Ordering::Release);
        self.permit.store(true, Ordering::Release);
    }

    pub fn is_invalidated(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Waits for the permit and consumes it.
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(DeviceError::Disconnected);
            }
            if self
                .permit
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("No ready signal within {} ms", timeout.as_millis());
                return Err(DeviceError::PacingTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            sleep(self.poll).await;
        }
    }

    pub async fn acquire_default(&self) -> Result<()> {
        self.acquire(self.default_timeout).await
    }

    /// Raises the permit on every ready byte seen on `status_uuid`.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<TransportEvent>,
        status_uuid: Uuid,
    ) -> JoinHandle<()> {
        let gate = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Notification { uuid, value }) if uuid == status_uuid => {
                        if value.first() == Some(&status::READY) {
                            let Some(gate) = gate.upgrade() else { break };
                            trace!("Ready signal received");
                            gate.signal_ready();
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Pacing listener lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Pacing listener stopped");
        })
    }
}
