use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::IngestError;
use crate::record::{Record, RecordCodec};
use crate::rotate::Rotator;
use crate::segment::ActiveSegment;
use crate::store::{CopyTarget, RecordStore};

/// Dual-sink ingestion: best-effort database load, then the durable
/// append that decides success.
pub struct Ingestor {
    db: Option<Arc<dyn RecordStore>>,
    segment: Arc<ActiveSegment>,
    rotator: Arc<Rotator>,
    codec: RecordCodec,
}

impl Ingestor {
    pub fn new(db: Option<Arc<dyn RecordStore>>, rotator: Arc<Rotator>, codec: RecordCodec) -> Self {
        Self {
            db,
            segment: rotator.segment().clone(),
            rotator,
            codec,
        }
    }

    pub fn rotator(&self) -> &Arc<Rotator> {
        &self.rotator
    }

    /// Decode a request body and ingest it. Returns the number of records
    /// durably appended.
    pub async fn ingest(&self, body: &[u8], cancel: &CancellationToken) -> Result<usize, IngestError> {
        let records = self.codec.decode_batch(body)?;
        self.ingest_records(&records, cancel).await?;
        Ok(records.len())
    }

    pub async fn ingest_records(&self, records: &[Record], cancel: &CancellationToken) -> Result<(), IngestError> {
        if records.is_empty() {
            return Ok(());
        }

        if let Some(db) = &self.db {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                copied = db.copy_records(CopyTarget::Live, records) => match copied {
                    Ok(rows) => tracing::debug!(rows, "copied to database"),
                    Err(e) => tracing::warn!(error = %e, entries = records.len(), "database load failed, archive path continues"),
                },
            }
        }

        self.segment.append(records).map_err(IngestError::Append)?;

        if let Err(e) = self.rotator.maybe_rotate(false).await {
            tracing::error!(error = %e, "rotation failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archiver;
    use crate::error::StoreError;
    use crate::store::MemoryRecordStore;

    fn build(dir: &std::path::Path, db: Option<Arc<dyn RecordStore>>) -> Ingestor {
        let segment = Arc::new(ActiveSegment::open(dir.join("kong.log"), 256).unwrap());
        let rotator = Arc::new(Rotator::new(segment, Arc::new(Archiver::local(1)), 1000, 1, 10));
        Ingestor::new(db, rotator, RecordCodec::default())
    }

    #[tokio::test]
    async fn writes_to_both_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryRecordStore::new());
        let ingestor = build(dir.path(), Some(db.clone()));

        let n = ingestor
            .ingest(br#"[{"started_at":1},{"started_at":2}]"#, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(n, 2);
        assert_eq!(db.live_len(), 2);
        assert_eq!(ingestor.segment.appended(), 2);
    }

    #[tokio::test]
    async fn invalid_body_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryRecordStore::new());
        let ingestor = build(dir.path(), Some(db.clone()));

        let err = ingestor.ingest(b"{}", &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, IngestError::Decode(_)));
        assert_eq!(db.live_len(), 0);
        assert_eq!(ingestor.segment.appended(), 0);
    }

    #[tokio::test]
    async fn database_failure_does_not_fail_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryRecordStore::new());
        db.fail_copies(StoreError::connect("connection refused"));
        let ingestor = build(dir.path(), Some(db.clone()));

        let n = ingestor.ingest(br#"[{"started_at":1}]"#, &CancellationToken::new()).await.unwrap();

        assert_eq!(n, 1);
        assert_eq!(std::fs::read_to_string(ingestor.segment.path()).unwrap(), "{\"started_at\":1}\n");
    }

    #[tokio::test]
    async fn empty_array_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = build(dir.path(), None);
        assert_eq!(ingestor.ingest(b"[]", &CancellationToken::new()).await.unwrap(), 0);
    }
}
