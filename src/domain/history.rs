//! Prayer-activity archive records.
//!
//! The archive is a flat array of 5-byte records: a little-endian UNIX
//! timestamp followed by a packed flags byte (category in bits 5-7,
//! sub-index in bits 2-4, intention flag in bit 0).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

pub const RECORD_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PrayerCategory {
    None,
    Joyful,
    Luminous,
    Sorrowful,
    Glorious,
    DivineMercy,
    Other(u8),
}

impl From<u8> for PrayerCategory {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Joyful,
            2 => Self::Luminous,
            3 => Self::Sorrowful,
            4 => Self::Glorious,
            5 => Self::DivineMercy,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub timestamp: u32,
    pub category: PrayerCategory,
    pub sub_index: u8,
    pub intention: bool,
}

impl HistoryRecord {
    pub fn from_bytes(raw: [u8; RECORD_SIZE]) -> Self {
        let flags = raw[4];
        Self {
            timestamp: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            category: PrayerCategory::from((flags >> 5) & 0x07),
            sub_index: (flags >> 2) & 0x07,
            intention: flags & 0x01 != 0,
        }
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0)
    }

    /// Sub-index 0 marks a whole chaplet, anything else a single decade.
    pub fn is_chaplet(&self) -> bool {
        self.sub_index == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    pub records: usize,
    pub decades: usize,
    pub chaplets: usize,
    pub intentions: usize,
}

/// Parses every whole record; a trailing partial record is ignored.
pub fn parse_records(bytes: &[u8]) -> Vec<HistoryRecord> {
    let trailing = bytes.len() % RECORD_SIZE;
    if trailing != 0 {
        warn!(
            size = bytes.len(),
            trailing, "History size is not a multiple of the record size"
        );
    }
    bytes
        .chunks_exact(RECORD_SIZE)
        .map(|c| HistoryRecord::from_bytes([c[0], c[1], c[2], c[3], c[4]]))
        .collect()
}

pub fn summarize(records: &[HistoryRecord]) -> HistorySummary {
    records
        .iter()
        .fold(HistorySummary::default(), |mut summary, record| {
            summary.records += 1;
            if record.is_chaplet() {
                summary.chaplets += 1;
            } else {
                summary.decades += 1;
            }
            if record.intention {
                summary.intentions += 1;
            }
            summary
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u32, flags: u8) -> Vec<u8> {
        let mut raw = ts.to_le_bytes().to_vec();
        raw.push(flags);
        raw
    }

    #[test]
    fn test_flags_unpacking() {
        // Sorrowful, third decade, with intention.
        let rec = HistoryRecord::from_bytes([0x00, 0xE1, 0xF5, 0x05, (3 << 5) | (3 << 2) | 1]);
        assert_eq!(rec.timestamp, 100_000_000);
        assert_eq!(rec.category, PrayerCategory::Sorrowful);
        assert_eq!(rec.sub_index, 3);
        assert!(rec.intention);
        assert!(!rec.is_chaplet());
        assert_eq!(rec.datetime().unwrap().timestamp(), 100_000_000);
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let mut bytes = record(1_700_000_000, 5 << 5);
        bytes.extend(record(1_700_000_100, (1 << 5) | (2 << 2)));
        bytes.extend([0xAA, 0xBB]);
        let records = parse_records(&bytes);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].category, PrayerCategory::DivineMercy);
        assert_eq!(records[1].category, PrayerCategory::Joyful);
    }

    #[test]
    fn test_summary_counts() {
        let mut bytes = record(1, 0);
        bytes.extend(record(2, 1 << 2));
        bytes.extend(record(3, (2 << 2) | 1));
        let summary = summarize(&parse_records(&bytes));
        assert_eq!(
            summary,
            HistorySummary {
                records: 3,
                decades: 2,
                chaplets: 1,
                intentions: 1,
            }
        );
    }

    #[test]
    fn test_unknown_category_kept() {
        assert_eq!(PrayerCategory::from(7), PrayerCategory::Other(7));
    }
}
