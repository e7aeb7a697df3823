//! On-device consent handshake.

use super::transport::{GattTransport, TransportEvent, WriteMode};
use crate::domain::models::ConsentKind;
use crate::error::{DeviceError, Result};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CONSENT_TIMEOUT: Duration = Duration::from_secs(25);

pub struct ConsentHandshake<'a> {
    transport: &'a dyn GattTransport,
    control: Uuid,
    status: Uuid,
    timeout: Duration,
}

impl<'a> ConsentHandshake<'a> {
    pub fn new(transport: &'a dyn GattTransport, control: Uuid, status: Uuid) -> Self {
        Self {
            transport,
            control,
            status,
            timeout: CONSENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends HELLO and waits for the verdict. `Ok(false)` covers both an
    /// explicit denial and the timeout.
    pub async fn run(&self, kind: ConsentKind) -> Result<bool> {
        // Listen before writing so a fast answer is not missed.
        self.transport.subscribe(self.status).await?;
        let mut events = self.transport.events();

        info!("Requesting {} consent, confirm on the device", kind);
        self.transport
            .write(self.control, kind.hello_frame(), WriteMode::WithResponse)
            .await?;

        let (granted, denied) = kind.status_bytes();
        let status = self.status;
        let verdict = timeout(self.timeout, async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Notification { uuid, value }) if uuid == status => {
                        match value.first() {
                            Some(&b) if b == granted => return Ok(true),
                            Some(&b) if b == denied => return Ok(false),
                            other => debug!("Ignoring status byte {:?} during handshake", other),
                        }
                    }
                    Ok(TransportEvent::Notification { .. }) => {}
                    Ok(TransportEvent::Disconnected) | Err(RecvError::Closed) => {
                        return Err(DeviceError::Disconnected)
                    }
                    Err(RecvError::Lagged(n)) => warn!("Consent listener lagged by {} events", n),
                }
            }
        })
        .await;

        match verdict {
            Ok(Ok(granted)) => {
                info!(granted, "{} consent answered", kind);
                Ok(granted)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "{} consent timed out after {} s",
                    kind,
                    self.timeout.as_secs()
                );
                Ok(false)
            }
        }
    }
}
