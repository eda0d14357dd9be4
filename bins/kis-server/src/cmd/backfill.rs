use kis_core::{Backfill, RecordCodec, RecordStore};

use super::{build_object_store, connect_database};
use crate::config::BackfillArgs;
use crate::error::ServerError;

pub async fn run(args: BackfillArgs) -> Result<(), ServerError> {
    let config = args.effective()?;
    tracing::info!(config = %args.common.config, "loaded config");

    if !config.database.enabled {
        return Err(ServerError::Disabled("[database]"));
    }
    if config.archive.bucket.is_empty() && config.archive.local_root.is_none() {
        return Err(ServerError::Disabled("[archive]"));
    }

    let store = build_object_store(&config.archive)?;
    let db = connect_database(&config.database).await?;
    db.check(true).await?;

    let report = Backfill::new(
        store,
        db,
        config.archive.folder.clone(),
        config.database.backfill_parallelism,
    )
    .with_codec(RecordCodec::new(config.file.timestamp_field.clone()))
    .with_capacity_hint(config.file.rotate_interval)
    .run()
    .await?;

    if report.failed > 0 || report.skipped > 0 || report.merge_failures > 0 {
        tracing::warn!(
            skipped = report.skipped,
            failed = report.failed,
            merge_failures = report.merge_failures,
            "backfill finished with problems"
        );
    }
    tracing::info!(processed = report.processed(), rows = report.rows, "backfill complete");
    Ok(())
}
