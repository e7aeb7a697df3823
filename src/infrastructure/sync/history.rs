//! Prayer history over the file-system service.
//!
//! Download is pull-model (one NEXT request per chunk); restore is a
//! credit-gated upload of the raw archive.

use super::queue::SyncQueue;
use crate::domain::history::{self, HistoryRecord, HistorySummary, RECORD_SIZE};
use crate::error::{AbortReason, DeviceError, Result};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::service::DeviceSession;
use crate::infrastructure::transfer::session::{AbortHandle, ChunkLimits};
use crate::infrastructure::transfer::{
    BulkProtocol, BulkSignal, BulkTransferEngine, DownloadOutcome, TransferTiming, UploadOutcome,
};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub mod op {
    pub const LIST: u8 = 0x70;
    pub const OPEN: u8 = 0x71;
    pub const NEXT: u8 = 0x72;
    pub const CLOSE: u8 = 0x73;
    pub const RESTORE_BEGIN: u8 = 0x77;
    pub const RESTORE_DATA: u8 = 0x78;
    pub const RESTORE_DONE: u8 = 0x79;
    pub const SET_RTC: u8 = 0x7A;
}

/// Bulk-status codes, each followed by a little-endian u32 `aux`.
pub mod stat {
    pub const ACK: u8 = 0x00;
    pub const CREDIT: u8 = 0x01;
    pub const CRC_REJECTED: u8 = 0xC3;
    pub const SIZE: u8 = 0xD0;
    pub const COMPLETE: u8 = 0xD1;
    pub const CLOSED: u8 = 0xD2;
}

pub const HISTORY_FILE: &str = "history.bin";
pub const RESTORE_INITIAL_CHUNK: usize = 160;
const RELIST_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryProtocol;

impl BulkProtocol for HistoryProtocol {
    fn label(&self) -> &'static str {
        "history"
    }

    fn status_signals(&self, value: &[u8]) -> Vec<BulkSignal> {
        let Some(&code) = value.first() else {
            return Vec::new();
        };
        let aux = value
            .get(1..5)
            .and_then(|b| b.try_into().ok())
            .map_or(0, u32::from_le_bytes);
        let signal = match code {
            stat::SIZE => BulkSignal::SizeAnnounced(aux as usize),
            stat::COMPLETE => BulkSignal::Complete,
            stat::CLOSED => BulkSignal::Closed,
            stat::CREDIT => BulkSignal::Credits(1),
            stat::ACK => BulkSignal::Ack,
            stat::CRC_REJECTED => BulkSignal::Failed(AbortReason::CrcMismatch {
                expected: Some(aux),
                actual: None,
            }),
            other => {
                debug!(code = other, aux, "Unhandled history status");
                return Vec::new();
            }
        };
        vec![signal]
    }

    fn data_signal(&self, value: &[u8]) -> Option<BulkSignal> {
        Some(BulkSignal::Data {
            bytes: value.to_vec(),
            last: false,
        })
    }

    fn next_frame(&self) -> Option<Vec<u8>> {
        Some(vec![op::NEXT, 0x00, 0x00])
    }

    fn close_frame(&self) -> Option<Vec<u8>> {
        Some(vec![op::CLOSE])
    }

    fn data_opcode(&self) -> u8 {
        op::RESTORE_DATA
    }

    fn done_frame(&self) -> Vec<u8> {
        vec![op::RESTORE_DONE]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryListing {
    pub files: Vec<FileEntry>,
    /// Free-form file-system status line
    pub fs: Option<String>,
}

/// Newline-delimited JSON, one object per line; other lines are skipped.
pub fn parse_listing(replies: &[Vec<u8>]) -> HistoryListing {
    let mut listing = HistoryListing::default();
    for reply in replies {
        let text = String::from_utf8_lossy(reply);
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                debug!("Ignoring non-JSON listing line: {}", line);
                continue;
            };
            if let Ok(entry) = serde_json::from_value::<FileEntry>(value.clone()) {
                listing.files.push(entry);
            }
            if let Some(fs) = value.get("fs").and_then(|v| v.as_str()) {
                listing.fs = Some(fs.to_string());
            }
        }
    }
    listing
}

/// `[0x7A][dLen]["Mon DD YYYY"][tLen]["HH:MM:SS"]`
pub fn rtc_frame(now: &NaiveDateTime) -> Vec<u8> {
    let date = now.format("%b %d %Y").to_string();
    let time = now.format("%H:%M:%S").to_string();
    let mut frame = Vec::with_capacity(3 + date.len() + time.len());
    frame.push(op::SET_RTC);
    frame.push(date.len() as u8);
    frame.extend_from_slice(date.as_bytes());
    frame.push(time.len() as u8);
    frame.extend_from_slice(time.as_bytes());
    frame
}

/// `[0x77][size u32 LE]`
pub fn restore_begin_frame(size: usize) -> Result<Vec<u8>> {
    let size = u32::try_from(size)
        .map_err(|_| DeviceError::InvalidFrame(format!("history too large: {size} bytes")))?;
    let mut frame = vec![op::RESTORE_BEGIN];
    frame.extend_from_slice(&size.to_le_bytes());
    Ok(frame)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryDownload {
    pub outcome: DownloadOutcome,
    pub records: Vec<HistoryRecord>,
    pub summary: HistorySummary,
}

pub struct HistorySync {
    engine: BulkTransferEngine<HistoryProtocol>,
    queue: SyncQueue,
}

impl HistorySync {
    pub fn new(
        session: Arc<DeviceSession>,
        timing: TransferTiming,
        limits: ChunkLimits,
        queue: SyncQueue,
    ) -> Self {
        Self {
            engine: BulkTransferEngine::new(session, HistoryProtocol, timing, limits),
            queue,
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.engine.abort_handle()
    }

    pub async fn list(&self) -> Result<HistoryListing> {
        self.queue.run("history list", || self.list_now()).await
    }

    async fn list_now(&self) -> Result<HistoryListing> {
        let replies = self.engine.request_info(&[op::LIST], "LIST").await?;
        let listing = parse_listing(&replies);
        info!(files = listing.files.len(), fs = ?listing.fs, "History listing");
        Ok(listing)
    }

    /// Downloads and parses the archive.
    pub async fn download(&self) -> Result<HistoryDownload> {
        self.queue
            .run("history download", || self.download_now())
            .await
    }

    /// Download plus an end-to-end CRC-32 check over the whole archive.
    pub async fn download_verified(&self, expected_crc: u32) -> Result<HistoryDownload> {
        let download = self.download().await?;
        let actual = crc32fast::hash(&download.outcome.bytes);
        if actual != expected_crc {
            return Err(DeviceError::abort(
                HISTORY_FILE,
                AbortReason::CrcMismatch {
                    expected: Some(expected_crc),
                    actual: Some(actual),
                },
            ));
        }
        Ok(download)
    }

    async fn download_now(&self) -> Result<HistoryDownload> {
        let open = protocol::name_frame(op::OPEN, HISTORY_FILE)?;
        let outcome = self.engine.download(HISTORY_FILE, &open).await?;
        if let Some(announced) = outcome.announced {
            if outcome.bytes.len() < announced {
                warn!(
                    received = outcome.bytes.len(),
                    announced, "History download ended short"
                );
            }
        }
        let records = history::parse_records(&outcome.bytes);
        let summary = history::summarize(&records);
        info!(
            records = summary.records,
            decades = summary.decades,
            chaplets = summary.chaplets,
            intentions = summary.intentions,
            "History parsed"
        );
        Ok(HistoryDownload {
            outcome,
            records,
            summary,
        })
    }

    /// Uploads a raw archive, then lists again so callers see the new size.
    pub async fn restore(&self, bytes: &[u8]) -> Result<(UploadOutcome, HistoryListing)> {
        if bytes.len() % RECORD_SIZE != 0 {
            warn!(
                size = bytes.len(),
                "Restoring history that is not a whole number of records"
            );
        }
        self.queue
            .run("history restore", || async {
                let begin = restore_begin_frame(bytes.len())?;
                let initial = self.engine.limits().clamp(RESTORE_INITIAL_CHUNK);
                let outcome = self
                    .engine
                    .upload(HISTORY_FILE, &begin, bytes, initial)
                    .await?;
                sleep(RELIST_DELAY).await;
                let listing = self.list_now().await?;
                Ok((outcome, listing))
            })
            .await
    }

    pub async fn set_rtc(&self, now: NaiveDateTime) -> Result<()> {
        self.queue
            .run("history rtc", || async {
                info!(%now, "Setting device clock");
                self.engine.write_control(&rtc_frame(&now), "SET_RTC").await
            })
            .await
    }

    pub async fn set_rtc_now(&self) -> Result<()> {
        self.set_rtc(chrono::Local::now().naive_local()).await
    }

    /// List, then download.
    pub async fn refresh(&self) -> Result<(HistoryListing, HistoryDownload)> {
        let listing = self.list().await?;
        let download = self.download().await?;
        Ok((listing, download))
    }
}
