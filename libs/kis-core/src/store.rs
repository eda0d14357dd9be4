use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::record::{FINGERPRINT_LEN, Record};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Which table a bulk load goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyTarget {
    /// The table queries read from.
    Live,
    /// `{table}_backfill`, drained by [`RecordStore::merge_staging`].
    Staging,
}

/// The time-series database behind the pipeline.
pub trait RecordStore: Send + Sync {
    /// Bulk-load `(timestamp, fingerprint, raw)` tuples. Returns rows copied.
    fn copy_records<'a>(&'a self, target: CopyTarget, records: &'a [Record]) -> StoreFuture<'a, u64>;

    /// Move staged rows into the live table, ignoring rows whose natural key
    /// already exists, then delete the consumed staged rows. Idempotent.
    fn merge_staging(&self) -> StoreFuture<'_, ()>;

    /// Connectivity check. `deep` also validates the configured columns.
    fn check(&self, deep: bool) -> StoreFuture<'_, ()>;
}

// ════════════════════════════════════════════════════════════════
//  MemoryRecordStore
// ════════════════════════════════════════════════════════════════

type NaturalKey = (DateTime<Utc>, [u8; FINGERPRINT_LEN]);

/// In-process [`RecordStore`]. The live table is keyed by
/// `(timestamp, fingerprint)` so merges follow the same no-op-on-conflict
/// rule as the database procedure.
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    live: BTreeMap<NaturalKey, String>,
    staging: Vec<Record>,
    merges: usize,
    copy_failure: Option<StoreError>,
    merge_failure: Option<StoreError>,
    copy_delay: Option<Duration>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following copy fail with `err`.
    pub fn fail_copies(&self, err: StoreError) {
        self.lock().copy_failure = Some(err);
    }

    /// Make every following merge fail with `err`.
    pub fn fail_merges(&self, err: StoreError) {
        self.lock().merge_failure = Some(err);
    }

    /// Delay every following copy, simulating a slow database.
    pub fn delay_copies(&self, delay: Duration) {
        self.lock().copy_delay = Some(delay);
    }

    pub fn live_rows(&self) -> Vec<(DateTime<Utc>, [u8; FINGERPRINT_LEN], String)> {
        self.lock()
            .live
            .iter()
            .map(|((ts, fp), raw)| (*ts, *fp, raw.clone()))
            .collect()
    }

    pub fn live_len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn staged_len(&self) -> usize {
        self.lock().staging.len()
    }

    pub fn merges(&self) -> usize {
        self.lock().merges
    }

    /// Stage rows directly, bypassing `copy_records` failure injection.
    pub fn stage(&self, records: &[Record]) {
        self.lock().staging.extend_from_slice(records);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStore for MemoryRecordStore {
    fn copy_records<'a>(&'a self, target: CopyTarget, records: &'a [Record]) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let delay = self.lock().copy_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.lock();
            if let Some(err) = &state.copy_failure {
                return Err(err.clone());
            }
            match target {
                CopyTarget::Live => {
                    for record in records {
                        state.live.insert(record.natural_key(), record.raw.clone());
                    }
                }
                CopyTarget::Staging => state.staging.extend_from_slice(records),
            }
            Ok(records.len() as u64)
        })
    }

    fn merge_staging(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(err) = &state.merge_failure {
                return Err(err.clone());
            }
            let staged = std::mem::take(&mut state.staging);
            for record in staged {
                state.live.entry(record.natural_key()).or_insert(record.raw);
            }
            state.merges += 1;
            Ok(())
        })
    }

    fn check(&self, _deep: bool) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            match &self.lock().copy_failure {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordCodec;

    fn sample() -> Vec<Record> {
        let codec = RecordCodec::default();
        vec![
            codec.decode_line(r#"{"started_at":1,"n":1}"#),
            codec.decode_line(r#"{"started_at":2,"n":2}"#),
        ]
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let store = MemoryRecordStore::new();
        let rows = sample();

        store.stage(&rows);
        store.merge_staging().await.unwrap();
        let once = store.live_rows();

        store.stage(&rows);
        store.merge_staging().await.unwrap();
        let twice = store.live_rows();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
        assert_eq!(store.staged_len(), 0);
        assert_eq!(store.merges(), 2);
    }

    #[tokio::test]
    async fn merge_does_not_overwrite_live_rows() {
        let store = MemoryRecordStore::new();
        let rows = sample();
        store.copy_records(CopyTarget::Live, &rows).await.unwrap();

        let mut conflicting = rows[0].clone();
        conflicting.raw = "replacement".into();
        store.stage(&[conflicting]);
        store.merge_staging().await.unwrap();

        let live = store.live_rows();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|(_, _, raw)| raw != "replacement"));
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryRecordStore::new();
        store.fail_copies(StoreError::connect("down"));

        let err = store.copy_records(CopyTarget::Staging, &sample()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::StoreErrorKind::Connect);
        assert!(store.check(false).await.is_err());
        assert_eq!(store.staged_len(), 0);
    }
}
