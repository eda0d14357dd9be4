use chrono::{DateTime, Utc};
use serde_json::value::RawValue;

use crate::error::CodecError;

/// Width of a record fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 16;

/// One ingested log entry.
///
/// `raw` is exactly what lands in the active file (one line, no trailing
/// newline) and `fingerprint` is computed over those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub fingerprint: [u8; FINGERPRINT_LEN],
    pub raw: String,
}

impl Record {
    pub fn natural_key(&self) -> (DateTime<Utc>, [u8; FINGERPRINT_LEN]) {
        (self.timestamp, self.fingerprint)
    }
}

/// Content hash of a payload. Used for dedupe, not for security.
pub fn fingerprint(payload: &[u8]) -> [u8; FINGERPRINT_LEN] {
    xxhash_rust::xxh3::xxh3_128(payload).to_be_bytes()
}

// ════════════════════════════════════════════════════════════════
//  RecordCodec
// ════════════════════════════════════════════════════════════════

/// Turns request bodies and archive lines into [`Record`]s.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    timestamp_field: String,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new("started_at")
    }
}

impl RecordCodec {
    /// `timestamp_field` holds integer milliseconds since the epoch.
    pub fn new(timestamp_field: impl Into<String>) -> Self {
        Self { timestamp_field: timestamp_field.into() }
    }

    /// Decode an ingestion body. Anything but a JSON array fails the batch.
    pub fn decode_batch(&self, body: &[u8]) -> Result<Vec<Record>, CodecError> {
        let items: Vec<&RawValue> = serde_json::from_slice(body)?;
        Ok(items.into_iter().map(|item| self.decode_raw(item.get())).collect())
    }

    /// Decode one line of an active or archived file. Never fails: a line
    /// without a usable timestamp gets the zero timestamp.
    pub fn decode_line(&self, line: &str) -> Record {
        let ts_ms = self.extract_ts_ms(line).unwrap_or(0);
        Record {
            timestamp: timestamp_from_ms(ts_ms),
            fingerprint: fingerprint(line.as_bytes()),
            raw: line.to_string(),
        }
    }

    /// Split decompressed archive content into records, skipping blank lines.
    pub fn decode_lines(&self, text: &str, capacity_hint: usize) -> Vec<Record> {
        let mut records = Vec::with_capacity(capacity_hint);
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            records.push(self.decode_line(line));
        }
        records
    }

    fn decode_raw(&self, raw: &str) -> Record {
        if raw.contains(['\n', '\r']) {
            // Pretty-printed element: the active file is line-delimited.
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
                return self.decode_line(&value.to_string());
            }
        }
        self.decode_line(raw)
    }

    fn extract_ts_ms(&self, raw: &str) -> Option<i64> {
        let value: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw).ok()?;
        value.get(&self.timestamp_field)?.as_i64()
    }
}

/// Milliseconds since the epoch to a UTC instant; out-of-range values map
/// to the epoch.
pub fn timestamp_from_ms(ts_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts_ms).unwrap_or(DateTime::UNIX_EPOCH)
}
