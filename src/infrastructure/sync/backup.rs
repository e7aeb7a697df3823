//! JSON backup of the dashboard values and its replay as key/value writes.
//!
//! A backup is the info snapshot with the duration counters normalised. On
//! restore every field maps onto one firmware preference or statistic key.

use super::info::InfoSnapshot;
use crate::error::Result;
use crate::infrastructure::bluetooth::protocol::{KvEntry, KvTable, KvValue};
use crate::infrastructure::bluetooth::service::DeviceSession;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

/// Mystery sets in firmware index order.
const SET_ORDER: [&str; 5] = ["none", "joyful", "luminous", "sorrowful", "glorious"];
const RING_DAYS: usize = 30;
const PARTS_PER_SET: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub fw_version: String,
    #[serde(default)]
    pub stats: Value,
    #[serde(default, alias = "prefs")]
    pub settings: Value,
    #[serde(default)]
    pub sets_parts: Option<Value>,
}

impl Backup {
    pub fn from_snapshot(snapshot: &InfoSnapshot) -> Self {
        let mut stats = snapshot.stats.clone();
        let durations = normalized_durations(&stats);
        if let Value::Object(map) = &mut stats {
            map.insert("durations".into(), durations);
        }
        Self {
            device: text(stats.get("device")),
            fw_version: text(snapshot.settings.get("fwVersion")),
            settings: snapshot.settings.clone(),
            sets_parts: snapshot
                .parts
                .as_ref()
                .and_then(|parts| present(parts.get("setsParts")))
                .cloned(),
            stats,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Download name the dashboard uses for this backup.
    pub fn file_name(&self) -> String {
        let device = if self.device.is_empty() {
            "rosary"
        } else {
            self.device.as_str()
        };
        format!("{device}_backup.json")
    }

    /// Every value the firmware restores, preferences first.
    pub fn to_entries(&self) -> Vec<KvEntry> {
        let mut entries = self.pref_entries();
        entries.extend(self.stat_entries());
        entries
    }

    fn pref_entries(&self) -> Vec<KvEntry> {
        let prefs = &self.settings;
        let at = |ptr: &str| present(prefs.pointer(ptr));
        let mut entries = Vec::with_capacity(15);
        let mut flag = |key: &str, value: Option<&Value>| {
            entries.push(pref(key, KvValue::Bool(truthy(value))));
        };
        flag("haptic-en", at("/haptic"));
        flag("m-preset-en", at("/mystery/preset"));
        flag("m-autosave-en", at("/mystery/autosave"));
        flag("m-intro-en", at("/mystery/intro"));
        flag(
            "m-intention",
            at("/mystery/intentionSelected").or(at("/mystery/iSel")),
        );
        flag("i-en", at("/intentions/enabled"));

        let ints = [
            ("disp-bright", at("/display/brightness"), 0),
            ("disp-rot", at("/display/rotation"), 0),
            ("wall-bright", at("/wallpaper/brightness"), 0),
            ("ImageIndex", at("/wallpaper/imageIndex"), 0),
            ("beadIndex", at("/mystery/beadIndex"), -1),
            ("m-pos", at("/mystery/pos"), 0),
            ("m-part", at("/mystery/part"), 0),
            (
                "m-select",
                at("/mystery/selection").or(at("/mystery/sel")),
                0,
            ),
            ("i-pos", at("/intentions/pos"), 0),
        ];
        for (key, value, default) in ints {
            let n = value.map_or(default, |v| int(Some(v)));
            entries.push(pref(key, KvValue::I32(n as i32)));
        }
        entries
    }

    fn stat_entries(&self) -> Vec<KvEntry> {
        let stats = &self.stats;
        let at = |ptr: &str| present(stats.pointer(ptr));
        let u32_of = |value: Option<&Value>| KvValue::U32(int(value) as u32);
        let u64_of = |value: Option<&Value>| KvValue::U64(wide(value));
        let mut entries = Vec::with_capacity(78);

        for key in ["beads", "paters", "glorias", "decades", "rosaries"] {
            entries.push(stat(key, u32_of(at(&format!("/totals/{key}")))));
        }

        let last_set = at("/lastMystery/set")
            .and_then(Value::as_str)
            .and_then(set_index)
            .unwrap_or(0);
        entries.push(stat("lastSet", KvValue::U8(last_set)));
        entries.push(stat("lastIdx", KvValue::U8(int(at("/lastMystery/index")) as u8)));
        entries.push(stat("lastTs", u32_of(at("/lastPrayer"))));
        entries.push(stat("streak", KvValue::U16(int(at("/streakDays")) as u16)));
        entries.push(stat("baseDay", KvValue::U32(0)));

        let ring = at("/ring").and_then(Value::as_array);
        for day in 0..RING_DAYS {
            let value = ring.and_then(|r| present(r.get(day)));
            entries.push(stat(&format!("r{day:02}"), KvValue::U16(int(value) as u16)));
        }

        for (index, set) in SET_ORDER.iter().enumerate() {
            entries.push(stat(&format!("set{index}"), u32_of(at(&format!("/sets/{set}")))));
        }

        let parts = self
            .sets_parts
            .as_ref()
            .and_then(|p| present(Some(p)))
            .or_else(|| at("/setsParts"));
        for (index, set) in SET_ORDER.iter().enumerate() {
            let counts = parts
                .and_then(|p| present(p.get(*set)))
                .and_then(Value::as_array);
            for part in 0..PARTS_PER_SET {
                let value = counts.and_then(|c| present(c.get(part)));
                entries.push(stat(&format!("p{index}{part}"), u32_of(value)));
            }
        }

        entries.push(stat("bSum", u64_of(at("/durations/totalBeadMs"))));
        entries.push(stat("bInt", u32_of(at("/durations/beadIntervals"))));
        entries.push(stat("dSum", u64_of(at("/durations/totalDecadeMs"))));
        entries.push(stat("dCnt", u32_of(at("/durations/decadeCount"))));
        entries.push(stat("rSum", u64_of(at("/durations/totalRosaryMs"))));
        entries.push(stat("rCnt", u32_of(at("/durations/rosaryCount"))));
        entries.push(stat("cSum", u64_of(at("/durations/totalChapletMs"))));
        entries.push(stat(
            "cCnt",
            u32_of(at("/totals/chaplets").or(at("/durations/chapletCount"))),
        ));
        entries
    }

    /// Replays the backup through the paced RESTORE sequence.
    pub async fn restore<F>(&self, session: &DeviceSession, progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let entries = self.to_entries();
        info!(device = %self.device, entries = entries.len(), "Restoring backup");
        session.restore_values(&entries, progress).await
    }
}

fn pref(key: &str, value: KvValue) -> KvEntry {
    KvEntry {
        table: KvTable::Pref,
        key: key.to_string(),
        value,
    }
}

fn stat(key: &str, value: KvValue) -> KvEntry {
    KvEntry {
        table: KvTable::Stat,
        key: key.to_string(),
        value,
    }
}

fn set_index(name: &str) -> Option<u8> {
    match name {
        "None" => Some(0),
        "Joyful" => Some(1),
        "Luminous" => Some(2),
        "Sorrowful" => Some(3),
        "Glorious" => Some(4),
        "Chaplet" => Some(5),
        _ => None,
    }
}

/// Counts the device left at zero are derived from sum and average. Sums
/// are written as decimal strings.
fn normalized_durations(stats: &Value) -> Value {
    let durations = present(stats.get("durations"));
    let field = |name: &str| durations.and_then(|d| present(d.get(name)));

    let count = |count_value: Option<&Value>, sum: u64, avg_key: &str| -> u64 {
        let n = wide(count_value);
        if n != 0 {
            return n;
        }
        let avg = wide(field(avg_key));
        if avg > 0 {
            sum / avg
        } else {
            0
        }
    };

    let bead_sum = wide(field("totalBeadMs"));
    let decade_sum = wide(field("totalDecadeMs"));
    let rosary_sum = wide(field("totalRosaryMs"));
    let chaplet_sum = wide(field("totalChapletMs"));
    let chaplets = present(stats.pointer("/totals/chaplets")).or(field("chapletCount"));

    let mut out = durations
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    let normalized = json!({
        "beadIntervals": count(field("beadIntervals"), bead_sum, "avgBeadMs"),
        "decadeCount": count(field("decadeCount"), decade_sum, "avgDecadeMs"),
        "rosaryCount": count(field("rosaryCount"), rosary_sum, "avgRosaryMs"),
        "chapletCount": count(chaplets, chaplet_sum, "avgChapletMs"),
        "totalBeadMs": bead_sum.to_string(),
        "totalDecadeMs": decade_sum.to_string(),
        "totalRosaryMs": rosary_sum.to_string(),
        "totalChapletMs": chaplet_sum.to_string(),
    });
    if let Value::Object(normalized) = normalized {
        out.extend(normalized);
    }
    Value::Object(out)
}

/// `null` counts as missing.
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn text(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Numbers, numeric strings and booleans; anything else is 0.
fn int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| u as i64))
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0)
        }
        Some(Value::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

/// Like [`int`] but keeps the full unsigned 64-bit range.
fn wide(value: Option<&Value>) -> u64 {
    let fallback = || int(value).max(0) as u64;
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or_else(fallback),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_else(|_| fallback()),
        _ => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> InfoSnapshot {
        InfoSnapshot {
            settings: json!({
                "fwVersion": "2.4.1",
                "haptic": true,
                "display": { "brightness": 180, "rotation": 2 },
                "wallpaper": { "brightness": 90, "imageIndex": 3 },
                "mystery": { "preset": 1, "autosave": false, "iSel": 1, "sel": 4, "pos": 7 },
                "intentions": { "enabled": true, "pos": 2 }
            }),
            stats: json!({
                "device": "Rosary-7F",
                "totals": { "beads": 5300, "paters": 530, "glorias": 530,
                            "decades": 530, "rosaries": 106, "chaplets": 9 },
                "lastMystery": { "set": "Sorrowful", "index": 2 },
                "lastPrayer": 1_712_000_000u32,
                "streakDays": 12,
                "ring": [1, 2, 3],
                "sets": { "joyful": 40, "glorious": 66 },
                "durations": {
                    "totalBeadMs": 6_000_000_000u64,
                    "avgBeadMs": 4000,
                    "totalDecadeMs": 900_000,
                    "decadeCount": 3,
                    "avgChapletMs": 0
                }
            }),
            parts: Some(json!({
                "setsParts": { "sorrowful": [1, 2, 3, 4, 5] }
            })),
        }
    }

    fn value_of<'a>(entries: &'a [KvEntry], key: &str) -> &'a KvValue {
        &entries
            .iter()
            .find(|e| e.key == key)
            .unwrap_or_else(|| panic!("no entry {key}"))
            .value
    }

    #[test]
    fn test_snapshot_normalizes_durations() {
        let backup = Backup::from_snapshot(&snapshot());
        assert_eq!(backup.device, "Rosary-7F");
        assert_eq!(backup.fw_version, "2.4.1");
        assert_eq!(backup.file_name(), "Rosary-7F_backup.json");

        let d = &backup.stats["durations"];
        assert_eq!(d["beadIntervals"], 1_500_000);
        assert_eq!(d["decadeCount"], 3);
        assert_eq!(d["chapletCount"], 9);
        assert_eq!(d["totalBeadMs"], "6000000000");
        assert_eq!(d["avgBeadMs"], 4000);
        assert_eq!(backup.sets_parts.as_ref().unwrap()["sorrowful"][4], 5);
    }

    #[test]
    fn test_json_round_trip_restores_the_same_values() {
        let backup = Backup::from_snapshot(&snapshot());
        let json = backup.to_json().unwrap();
        assert!(json.contains("\"fwVersion\""));
        assert!(json.contains("\"setsParts\""));

        let loaded = Backup::from_json(&json).unwrap();
        assert_eq!(loaded, backup);

        let entries = loaded.to_entries();
        assert_eq!(entries, backup.to_entries());
        assert_eq!(entries.len(), 93);
        assert_eq!(entries.iter().filter(|e| e.table == KvTable::Pref).count(), 15);

        assert_eq!(value_of(&entries, "haptic-en"), &KvValue::Bool(true));
        assert_eq!(value_of(&entries, "m-preset-en"), &KvValue::Bool(true));
        assert_eq!(value_of(&entries, "m-autosave-en"), &KvValue::Bool(false));
        assert_eq!(value_of(&entries, "m-intention"), &KvValue::Bool(true));
        assert_eq!(value_of(&entries, "m-select"), &KvValue::I32(4));
        assert_eq!(value_of(&entries, "beadIndex"), &KvValue::I32(-1));
        assert_eq!(value_of(&entries, "disp-rot"), &KvValue::I32(2));
        assert_eq!(value_of(&entries, "lastSet"), &KvValue::U8(3));
        assert_eq!(value_of(&entries, "lastTs"), &KvValue::U32(1_712_000_000));
        assert_eq!(value_of(&entries, "streak"), &KvValue::U16(12));
        assert_eq!(value_of(&entries, "r02"), &KvValue::U16(3));
        assert_eq!(value_of(&entries, "r29"), &KvValue::U16(0));
        assert_eq!(value_of(&entries, "set1"), &KvValue::U32(40));
        assert_eq!(value_of(&entries, "set2"), &KvValue::U32(0));
        assert_eq!(value_of(&entries, "p34"), &KvValue::U32(5));
        assert_eq!(value_of(&entries, "p00"), &KvValue::U32(0));
        assert_eq!(value_of(&entries, "bSum"), &KvValue::U64(6_000_000_000));
        assert_eq!(value_of(&entries, "bInt"), &KvValue::U32(1_500_000));
        assert_eq!(value_of(&entries, "cCnt"), &KvValue::U32(9));
    }

    #[test]
    fn test_prefs_alias_and_empty_backup() {
        let backup = Backup::from_json(r#"{"prefs":{"mystery":{"beadIndex":12}}}"#).unwrap();
        let entries = backup.to_entries();
        assert_eq!(entries.len(), 93);
        assert_eq!(value_of(&entries, "beadIndex"), &KvValue::I32(12));
        assert_eq!(value_of(&entries, "lastSet"), &KvValue::U8(0));
        assert_eq!(backup.file_name(), "rosary_backup.json");
    }

    #[test]
    fn test_parts_fall_back_to_stats() {
        let backup = Backup::from_json(
            r#"{"stats":{"setsParts":{"joyful":[9,8]}},"setsParts":null}"#,
        )
        .unwrap();
        let entries = backup.to_entries();
        assert_eq!(value_of(&entries, "p10"), &KvValue::U32(9));
        assert_eq!(value_of(&entries, "p11"), &KvValue::U32(8));
        assert_eq!(value_of(&entries, "p12"), &KvValue::U32(0));
    }

    #[test]
    fn test_payload_bytes_match_the_frames() {
        let entries = Backup::from_snapshot(&snapshot()).to_entries();
        for entry in &entries {
            assert_eq!(entry.frame().unwrap().len(), 3 + entry.payload_len());
        }
    }
}
