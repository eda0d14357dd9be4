//! Replays archive objects into the database through the staging table.
//!
//! ```text
//! list → sort → [group of P] → download → gunzip → verify → parse → stage
//!                    │                                                │
//!                    └──────────── join all ─── merge_staging() ◄─────┘
//! ```
//!
//! A bad object never aborts the run. Only a failed listing does.

use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use flate2::read::MultiGzDecoder;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use tokio::task::JoinSet;

use crate::archive::sha256_hex;
use crate::error::BackfillError;
use crate::naming::checksum_from_key;
use crate::record::{Record, RecordCodec};
use crate::store::{CopyTarget, RecordStore};

/// Why an object was skipped without touching the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Key carries no 64-hex-digit checksum component.
    NoChecksum,
    /// Decompressed content does not hash to the checksum in the key.
    ChecksumMismatch { expected: String, actual: String },
}

/// Stage at which an object's processing stopped with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    Download,
    Decompress,
    Parse,
    Stage,
}

impl std::fmt::Display for FailedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailedStage::Download => f.write_str("download"),
            FailedStage::Decompress => f.write_str("decompress"),
            FailedStage::Parse => f.write_str("parse"),
            FailedStage::Stage => f.write_str("stage"),
        }
    }
}

/// Terminal state of one archive object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOutcome {
    Staged { key: String, rows: u64 },
    Skipped { key: String, reason: SkipReason },
    Failed { key: String, stage: FailedStage, error: String },
}

impl ObjectOutcome {
    pub fn key(&self) -> &str {
        match self {
            ObjectOutcome::Staged { key, .. }
            | ObjectOutcome::Skipped { key, .. }
            | ObjectOutcome::Failed { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub listed: usize,
    pub staged: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Rows copied into staging.
    pub rows: u64,
    pub merges: usize,
    pub merge_failures: usize,
}

impl BackfillReport {
    /// Objects that were verified and staged.
    pub fn processed(&self) -> usize {
        self.staged
    }

    fn record(&mut self, outcome: &ObjectOutcome) {
        match outcome {
            ObjectOutcome::Staged { rows, .. } => {
                self.staged += 1;
                self.rows += rows;
            }
            ObjectOutcome::Skipped { .. } => self.skipped += 1,
            ObjectOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Backfill
// ════════════════════════════════════════════════════════════════

pub struct Backfill {
    store: Arc<dyn ObjectStore>,
    db: Arc<dyn RecordStore>,
    folder: String,
    parallelism: usize,
    codec: RecordCodec,
    capacity_hint: usize,
}

impl Backfill {
    pub fn new(store: Arc<dyn ObjectStore>, db: Arc<dyn RecordStore>, folder: impl Into<String>, parallelism: usize) -> Self {
        Self {
            store,
            db,
            folder: folder.into(),
            parallelism: parallelism.max(1),
            codec: RecordCodec::default(),
            capacity_hint: 0,
        }
    }

    pub fn with_codec(mut self, codec: RecordCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Initial capacity of each object's record buffer, usually the
    /// rotation threshold.
    pub fn with_capacity_hint(mut self, capacity_hint: usize) -> Self {
        self.capacity_hint = capacity_hint;
        self
    }

    /// Process every archive under the folder, merging after each group.
    pub async fn run(&self) -> Result<BackfillReport, BackfillError> {
        let started = Instant::now();
        let keys = self.list().await?;
        let mut report = BackfillReport { listed: keys.len(), ..Default::default() };
        tracing::info!(objects = keys.len(), parallelism = self.parallelism, "backfill started");

        for group in keys.chunks(self.parallelism) {
            let mut tasks = JoinSet::new();
            for key in group {
                tasks.spawn(process_object(
                    self.store.clone(),
                    self.db.clone(),
                    self.codec.clone(),
                    key.clone(),
                    self.capacity_hint,
                ));
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => {
                        log_outcome(&outcome);
                        report.record(&outcome);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "backfill task panicked");
                        report.failed += 1;
                    }
                }
            }

            // Barrier: every task of the group has finished before this.
            match self.db.merge_staging().await {
                Ok(()) => report.merges += 1,
                Err(e) => {
                    tracing::error!(error = %e, "merge from staging failed");
                    report.merge_failures += 1;
                }
            }
        }

        tracing::info!(
            listed = report.listed,
            staged = report.staged,
            skipped = report.skipped,
            failed = report.failed,
            rows = report.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backfill finished"
        );
        Ok(report)
    }

    async fn list(&self) -> Result<Vec<ObjectPath>, BackfillError> {
        let folder = self.folder.trim_matches('/');
        let prefix = (!folder.is_empty()).then(|| ObjectPath::from(folder));
        let mut keys: Vec<ObjectPath> = self
            .store
            .list(prefix.as_ref())
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
            .map_err(|source| BackfillError::List { prefix: folder.to_string(), source })?;
        keys.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
        Ok(keys)
    }
}

fn log_outcome(outcome: &ObjectOutcome) {
    match outcome {
        ObjectOutcome::Staged { key, rows } => tracing::info!(%key, rows, "staged"),
        ObjectOutcome::Skipped { key, reason } => tracing::warn!(%key, ?reason, "skipped archive"),
        ObjectOutcome::Failed { key, stage, error } => tracing::error!(%key, %stage, %error, "archive failed"),
    }
}

/// Parsed content of one verified object, or why it stopped.
enum Decoded {
    Records(Vec<Record>),
    Skipped(SkipReason),
    Failed(FailedStage, String),
}

async fn process_object(
    store: Arc<dyn ObjectStore>,
    db: Arc<dyn RecordStore>,
    codec: RecordCodec,
    location: ObjectPath,
    capacity_hint: usize,
) -> ObjectOutcome {
    let key = location.to_string();

    let Some(expected) = checksum_from_key(&key).map(str::to_string) else {
        return ObjectOutcome::Skipped { key, reason: SkipReason::NoChecksum };
    };

    let data = match store.get(&location).await {
        Ok(result) => match result.bytes().await {
            Ok(data) => data,
            Err(e) => return failed(key, FailedStage::Download, e),
        },
        Err(e) => return failed(key, FailedStage::Download, e),
    };

    let decoded = tokio::task::spawn_blocking(move || decode_object(&data, &expected, &codec, capacity_hint)).await;
    let records = match decoded {
        Ok(Decoded::Records(records)) => records,
        Ok(Decoded::Skipped(reason)) => return ObjectOutcome::Skipped { key, reason },
        Ok(Decoded::Failed(stage, error)) => return failed(key, stage, error),
        Err(e) => return failed(key, FailedStage::Decompress, e),
    };

    match db.copy_records(CopyTarget::Staging, &records).await {
        Ok(rows) => ObjectOutcome::Staged { key, rows },
        Err(e) => failed(key, FailedStage::Stage, e),
    }
}

fn failed(key: String, stage: FailedStage, error: impl ToString) -> ObjectOutcome {
    ObjectOutcome::Failed { key, stage, error: error.to_string() }
}

/// Upper bound for the up-front decompression buffer; larger objects grow it.
const MAX_INITIAL_PLAIN_BYTES: usize = 8 * 1024 * 1024;

fn initial_plain_capacity(compressed: usize) -> usize {
    compressed.saturating_mul(4).min(MAX_INITIAL_PLAIN_BYTES)
}

fn decode_object(data: &[u8], expected: &str, codec: &RecordCodec, capacity_hint: usize) -> Decoded {
    let mut plain = Vec::with_capacity(initial_plain_capacity(data.len()));
    if let Err(e) = MultiGzDecoder::new(data).read_to_end(&mut plain) {
        return Decoded::Failed(FailedStage::Decompress, e.to_string());
    }

    let actual = sha256_hex(&plain);
    if !actual.eq_ignore_ascii_case(expected) {
        return Decoded::Skipped(SkipReason::ChecksumMismatch { expected: expected.to_string(), actual });
    }

    match String::from_utf8(plain) {
        Ok(text) => Decoded::Records(codec.decode_lines(&text, capacity_hint)),
        Err(e) => Decoded::Failed(FailedStage::Parse, e.to_string()),
    }
}
