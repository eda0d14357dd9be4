pub mod backfill;
pub mod serve;

use std::sync::Arc;

use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;

use kis_core::RecordStore;
use kis_core::config::{ArchiveSection, DatabaseSection};
use kis_timescale::TimescaleStore;

use crate::error::ServerError;

/// S3 (или S3-совместимый) bucket, либо локальная директория при заданном `local_root`.
pub(crate) fn build_object_store(archive: &ArchiveSection) -> Result<Arc<dyn ObjectStore>, ServerError> {
    if let Some(root) = &archive.local_root {
        std::fs::create_dir_all(root).map_err(|source| ServerError::Io { context: "create archive root", path: root.clone(), source })?;
        tracing::info!(root = %root, "archive store: local directory");
        return Ok(Arc::new(LocalFileSystem::new_with_prefix(root)?));
    }

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&archive.bucket)
        .with_allow_http(archive.allow_http);
    if let Some(region) = &archive.region {
        builder = builder.with_region(region);
    }
    if let Some(key) = &archive.access_key_id {
        builder = builder.with_access_key_id(key);
    }
    if let Some(secret) = &archive.secret_access_key {
        builder = builder.with_secret_access_key(secret);
    }
    if let Some(endpoint) = &archive.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    tracing::info!(bucket = %archive.bucket, folder = %archive.folder, "archive store: s3");
    Ok(Arc::new(builder.build()?))
}

pub(crate) async fn connect_database(database: &DatabaseSection) -> Result<Arc<dyn RecordStore>, ServerError> {
    let store = TimescaleStore::connect(database).await?;
    Ok(Arc::new(store))
}
