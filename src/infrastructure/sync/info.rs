//! Dashboard snapshot: settings, stats and rosary parts read as JSON from
//! the info service, plus the intentions schedule.

use crate::domain::recovery::{self, OversizedField, Recovered};
use crate::error::Result;
use crate::infrastructure::bluetooth::protocol::CharacteristicRole;
use crate::infrastructure::bluetooth::robust_io::RetryPolicy;
use crate::infrastructure::bluetooth::service::DeviceSession;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const PRE_READ_DELAY: Duration = Duration::from_millis(200);
const STATS_DELAY: Duration = Duration::from_millis(80);
/// Failed refresh attempt after which characteristics are re-bound.
const REACQUIRE_AFTER: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct InfoSnapshot {
    pub settings: Value,
    pub stats: Value,
    pub parts: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InfoStatus {
    Ready(InfoSnapshot),
    /// Empty payload, `{}`, or JSON nothing could salvage.
    NotReady,
    /// The device wants on-device approval before it serves data.
    ConsentRequired,
}

impl InfoStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntentionsSummary {
    pub present: bool,
    pub count: usize,
    pub auto: bool,
    pub selected: Option<u64>,
    pub names: Vec<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentionsStatus {
    Ready(IntentionsSummary),
    ConsentRequired,
}

fn requires_consent(value: &Value) -> bool {
    value
        .get("requireConsent")
        .is_some_and(|v| v.as_bool().unwrap_or(false) || v.as_u64().is_some_and(|n| n != 0))
}

/// `None` when the payload is empty or an empty object.
fn parse_payload(raw: &[u8], drop: Option<OversizedField>, context: &str) -> Option<Value> {
    let text = recovery::clean_payload(raw);
    if text.is_empty() || text == "{}" {
        debug!("{} payload empty", context);
        return None;
    }
    match recovery::recover_json(&text, drop, context) {
        Ok(Recovered { value, recovery }) => {
            debug!(?recovery, "{} parsed", context);
            Some(value)
        }
        Err(e) => {
            warn!("{} JSON failed after recovery: {}", context, e);
            None
        }
    }
}

pub struct InfoSync {
    session: Arc<DeviceSession>,
    refresh: RetryPolicy,
}

impl InfoSync {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self {
            session,
            refresh: RetryPolicy::new(8, Duration::from_millis(250), 1.4),
        }
    }

    pub fn with_refresh_policy(mut self, policy: RetryPolicy) -> Self {
        self.refresh = policy;
        self
    }

    /// One pass over Settings, Parts (when bound) and Stats.
    pub async fn read_snapshot(&self) -> Result<InfoStatus> {
        sleep(PRE_READ_DELAY).await;
        let settings_raw = self.session.robust_read(CharacteristicRole::Settings).await?;

        let bindings = self.session.connection().bindings();
        let parts_raw = if bindings.is_bound(CharacteristicRole::Parts) {
            match self.session.robust_read(CharacteristicRole::Parts).await {
                Ok(raw) => Some(raw),
                Err(e) => {
                    warn!("Parts read skipped: {}", e);
                    None
                }
            }
        } else {
            None
        };

        sleep(STATS_DELAY).await;
        let stats_raw = self.session.robust_read(CharacteristicRole::Stats).await?;
        debug!(
            settings = settings_raw.len(),
            stats = stats_raw.len(),
            parts = ?parts_raw.as_ref().map(Vec::len),
            "Info payloads read"
        );

        let Some(settings) = parse_payload(&settings_raw, Some(OversizedField::Entries), "Settings")
        else {
            return Ok(InfoStatus::NotReady);
        };
        let Some(stats) = parse_payload(&stats_raw, None, "Stats") else {
            return Ok(InfoStatus::NotReady);
        };

        if requires_consent(&settings) || requires_consent(&stats) {
            warn!("Device reports consent required for info reads");
            return Ok(InfoStatus::ConsentRequired);
        }

        let parts = parts_raw.and_then(|raw| parse_payload(&raw, None, "Parts"));
        Ok(InfoStatus::Ready(InfoSnapshot {
            settings,
            stats,
            parts,
        }))
    }

    /// Retries `read_snapshot` with backoff until it is ready, re-binding
    /// once the early attempts keep failing. Errors are swallowed between
    /// attempts; the last attempt's result is returned.
    pub async fn refresh_until_valid(&self) -> Result<InfoStatus> {
        let tries = self.refresh.attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = self.read_snapshot().await;
            match &result {
                Ok(InfoStatus::Ready(_)) => {
                    info!(attempt = attempt + 1, "Info snapshot ready");
                    return result;
                }
                Ok(status) => debug!(attempt = attempt + 1, ?status, "Info not ready"),
                Err(e) => warn!("Info refresh attempt {} failed: {}", attempt + 1, e),
            }
            if attempt + 1 >= tries {
                return result;
            }
            sleep(self.refresh.delay(attempt)).await;
            if attempt == REACQUIRE_AFTER {
                if let Err(e) = self.session.reacquire().await {
                    debug!("Re-binding during refresh failed: {}", e);
                }
            }
            attempt += 1;
        }
    }

    /// Reads the intentions summary; the `intentions` field may be dropped
    /// when the payload was cut off.
    pub async fn read_intentions(&self) -> Result<IntentionsStatus> {
        let raw = self
            .session
            .robust_read(CharacteristicRole::Intentions)
            .await?;
        let text = recovery::clean_payload(&raw);
        let value = if text.is_empty() {
            Value::Object(Default::default())
        } else {
            recovery::recover_json(&text, Some(OversizedField::Intentions), "Intentions")?.value
        };
        if requires_consent(&value) {
            return Ok(IntentionsStatus::ConsentRequired);
        }

        let names = value
            .get("names")
            .and_then(Value::as_str)
            .map(|s| s.split('\n').map(str::to_string).collect())
            .unwrap_or_default();
        Ok(IntentionsStatus::Ready(IntentionsSummary {
            present: value.get("present").and_then(Value::as_bool).unwrap_or(false),
            count: value.get("count").and_then(Value::as_u64).unwrap_or(0) as usize,
            auto: value.get("auto").and_then(Value::as_bool).unwrap_or(false),
            selected: value.get("selected").and_then(Value::as_u64),
            names,
            raw: value,
        }))
    }

    /// Selects entry `index` (paced), then reads its detail.
    pub async fn read_intention_entry(&self, index: u16) -> Result<Value> {
        self.session
            .paced_write(CharacteristicRole::IntentionEntry, &index.to_le_bytes())
            .await?;
        let raw = self
            .session
            .robust_read(CharacteristicRole::IntentionEntry)
            .await?;
        let text = recovery::clean_payload(&raw);
        Ok(recovery::recover_json(&text, None, "Intention entry")?.value)
    }
}
