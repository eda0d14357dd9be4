use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use flate2::{Compression, GzBuilder};
use object_store::{ObjectStore, PutPayload};
use sha2::{Digest, Sha256};

use crate::error::ArchiveError;
use crate::naming::{archive_key, with_suffix};

/// Where archives go once compressed.
#[derive(Clone)]
pub struct RemoteTarget {
    pub store: Arc<dyn ObjectStore>,
    /// Key prefix.
    pub folder: String,
    /// Delete the local `.gz` after a confirmed upload.
    pub remove_sent_file: bool,
}

/// Result of a fully or partially archived retired file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    /// Local compressed file (may already be deleted, see `removed_local`).
    pub archive_path: PathBuf,
    /// Object key, when uploaded.
    pub key: Option<String>,
    pub removed_local: bool,
}

/// Checksum → compress → upload → cleanup for one retired file.
pub struct Archiver {
    remote: Option<RemoteTarget>,
    level: Compression,
}

impl Archiver {
    pub fn new(remote: Option<RemoteTarget>, compression_level: u32) -> Self {
        Self {
            remote,
            level: Compression::new(compression_level.min(9)),
        }
    }

    /// Local only: checksum and compress, never upload.
    pub fn local(compression_level: u32) -> Self {
        Self::new(None, compression_level)
    }

    pub fn remote(&self) -> Option<&RemoteTarget> {
        self.remote.as_ref()
    }

    /// Run every stage for `retired`. A failed stage skips all later ones.
    pub async fn archive(&self, retired: PathBuf, rotated_at: i64) -> Result<ArchiveOutcome, ArchiveError> {
        let started = Instant::now();

        // Checksum must cover the plaintext, so it runs before compression.
        let source = retired.clone();
        let named = tokio::task::spawn_blocking(move || rename_with_checksum(&source)).await??;

        let level = self.level;
        let plain = named.clone();
        let archive_path = tokio::task::spawn_blocking(move || gzip_file(&plain, level)).await??;
        tracing::info!(file = %archive_path.display(), "compressed");

        let mut outcome = ArchiveOutcome {
            archive_path: archive_path.clone(),
            key: None,
            removed_local: false,
        };

        if let Some(remote) = &self.remote {
            let key = self.upload(remote, &archive_path, rotated_at).await?;
            outcome.key = Some(key);

            if remote.remove_sent_file {
                match tokio::fs::remove_file(&archive_path).await {
                    Ok(()) => {
                        outcome.removed_local = true;
                        tracing::info!(file = %archive_path.display(), "removed local archive");
                    }
                    Err(e) => {
                        tracing::warn!(file = %archive_path.display(), error = %e, "failed to remove local archive");
                    }
                }
            }
        }

        tracing::info!(
            file = %retired.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "archived"
        );
        Ok(outcome)
    }

    async fn upload(&self, remote: &RemoteTarget, path: &Path, rotated_at: i64) -> Result<String, ArchiveError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = archive_key(&remote.folder, rotated_at, &file_name);

        let data = tokio::fs::read(path)
            .await
            .map_err(|source| ArchiveError::ReadForUpload { path: path.to_path_buf(), source })?;
        let size = data.len();

        remote
            .store
            .put(&object_store::path::Path::from(key.as_str()), PutPayload::from(data))
            .await
            .map_err(|source| ArchiveError::Upload { key: key.clone(), source })?;

        tracing::info!(file = %file_name, %key, bytes = size, "uploaded");
        Ok(key)
    }
}

// ════════════════════════════════════════════════════════════════
//  Stages
// ════════════════════════════════════════════════════════════════

/// Hex SHA-256 of a file's bytes.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of in-memory bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// True when `data` hashes to `expected` (hex, case-insensitive).
pub fn verify_checksum(data: &[u8], expected: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected)
}

/// Rename `source` to `{source}.{sha256}`.
pub fn rename_with_checksum(source: &Path) -> Result<PathBuf, ArchiveError> {
    let wrap = |e| ArchiveError::Checksum { path: source.to_path_buf(), source: e };
    let checksum = sha256_file(source).map_err(wrap)?;
    let target = with_suffix(source, &checksum);
    std::fs::rename(source, &target).map_err(wrap)?;
    Ok(target)
}

/// Gzip `source` into `{source}.gz`, recording the plain base name in the
/// gzip header, then delete `source`.
pub fn gzip_file(source: &Path, level: Compression) -> Result<PathBuf, ArchiveError> {
    let target = with_suffix(source, "gz");
    let wrap = |e| ArchiveError::Compress { path: source.to_path_buf(), source: e };

    let base_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut reader = BufReader::new(File::open(source).map_err(wrap)?);
    let writer = BufWriter::new(File::create(&target).map_err(wrap)?);
    let mut encoder = GzBuilder::new().filename(base_name).write(writer, level);
    std::io::copy(&mut reader, &mut encoder).map_err(wrap)?;
    let mut writer = encoder.finish().map_err(wrap)?;
    writer.flush().map_err(wrap)?;
    drop(writer);

    std::fs::remove_file(source).map_err(wrap)?;
    Ok(target)
}
