pub mod archive;
pub mod backfill;
pub mod config;
pub mod error;
pub mod health;
pub mod ingest;
pub mod naming;
pub mod record;
pub mod rotate;
pub mod segment;
pub mod store;
pub mod trigger;

pub use archive::{ArchiveOutcome, Archiver, RemoteTarget};
pub use backfill::{Backfill, BackfillReport, FailedStage, ObjectOutcome, SkipReason};
pub use config::KisConfig;
pub use error::{
    ArchiveError, BackfillError, CodecError, ConfigError, IngestError, RotateError, StoreError, StoreErrorKind,
};
pub use health::{HealthChecker, HealthReport, ProbeResult};
pub use ingest::Ingestor;
pub use record::{FINGERPRINT_LEN, Record, RecordCodec};
pub use rotate::{RotationResult, Rotator};
pub use segment::ActiveSegment;
pub use store::{CopyTarget, MemoryRecordStore, RecordStore, StoreFuture};
pub use trigger::{Trigger, run_trigger_loop, spawn_inactivity_monitor};
