//! Single-value reads that survive a degraded link.
//!
//! Three remedies, tried in order: plain retry with backoff (stack busy),
//! re-binding the characteristic set (stale handle), and a full reconnect
//! (severed link).

use super::connection::ConnectionManager;
use super::protocol::CharacteristicRole;
use super::transport::TransportError;
use crate::error::{DeviceError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, base: Duration, factor: f64) -> Self {
        Self {
            attempts,
            base,
            factor,
        }
    }

    /// Characteristic reads: 5 tries, 150 ms growing by 1.6.
    pub const fn reads() -> Self {
        Self::new(5, Duration::from_millis(150), 1.6)
    }

    /// Characteristic binding: 5 tries, 120 ms growing by 1.6.
    pub const fn bindings() -> Self {
        Self::new(5, Duration::from_millis(120), 1.6)
    }

    /// Delay after the zero-based `attempt` failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = self.base.as_millis() as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis(millis.round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reads()
    }
}

pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> std::result::Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 >= attempts => {
                warn!("{} failed after {} attempts: {}", label, attempts, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                debug!(
                    "{} attempt {} failed ({}), retrying in {} ms",
                    label,
                    attempt + 1,
                    e,
                    delay.as_millis()
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

pub struct RobustCharacteristicIo {
    connection: Arc<ConnectionManager>,
    policy: RetryPolicy,
}

impl RobustCharacteristicIo {
    pub fn new(connection: Arc<ConnectionManager>, policy: RetryPolicy) -> Self {
        Self { connection, policy }
    }

    /// Read with bounded retry.
    pub async fn read(&self, role: CharacteristicRole) -> Result<Vec<u8>> {
        let uuid = self.connection.uuid_for(role)?;
        let transport = self.connection.transport();
        let label = format!("read {role}");
        Ok(with_retry(&self.policy, &label, || transport.read(uuid)).await?)
    }

    /// Read, then re-bind and read, then reconnect and read.
    pub async fn robust_read(&self, role: CharacteristicRole) -> Result<Vec<u8>> {
        match self.read(role).await {
            Ok(value) => return Ok(value),
            Err(e @ DeviceError::CharacteristicMissing(_)) => return Err(e),
            Err(e) => warn!("Read of {} failed, re-binding characteristics: {}", role, e),
        }

        match self.connection.reacquire().await {
            Ok(_) => match self.read(role).await {
                Ok(value) => return Ok(value),
                Err(e) => warn!("Read of {} failed after re-binding: {}", role, e),
            },
            Err(e) => warn!("Re-binding failed: {}", e),
        }

        info!("Reconnecting before the last read of {}", role);
        if let Err(e) = self.connection.reconnect().await {
            return Err(exhausted(e));
        }
        self.read(role).await.map_err(exhausted)
    }
}

fn exhausted(error: DeviceError) -> DeviceError {
    match error {
        DeviceError::Transport(source) => DeviceError::ReconnectExhausted { source },
        DeviceError::ReconnectExhausted { source } => DeviceError::ReconnectExhausted { source },
        other => DeviceError::ReconnectExhausted {
            source: TransportError::Io(other.to_string()),
        },
    }
}
