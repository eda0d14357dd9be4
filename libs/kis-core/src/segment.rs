use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::record::Record;

// ════════════════════════════════════════════════════════════════
//  ActiveSegment
// ════════════════════════════════════════════════════════════════

/// The single active file plus the counters guarded with it.
///
/// All appends go through one lock (`state`). Rotation takes `rotation`
/// first and holds `state` only for close → rename → reopen.
pub struct ActiveSegment {
    path: PathBuf,
    buffer_increment: usize,
    state: Mutex<SegmentState>,
    rotation: Mutex<()>,
}

struct SegmentState {
    file: Option<File>,
    /// Records appended since the last successful rotation.
    appended: usize,
    last_timestamp: DateTime<Utc>,
}

impl ActiveSegment {
    /// Open (or create) the active file. The counter starts at the number
    /// of lines already in the file so a restart keeps rotation on schedule.
    pub fn open(path: impl Into<PathBuf>, buffer_increment: usize) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let appended = count_lines(&path)?;
        tracing::info!(file = %path.display(), appended, "opened active file");

        Ok(Self {
            path,
            buffer_increment,
            state: Mutex::new(SegmentState {
                file: Some(file),
                appended,
                last_timestamp: DateTime::UNIX_EPOCH,
            }),
            rotation: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended since the last successful rotation.
    pub fn appended(&self) -> usize {
        self.lock_state().appended
    }

    /// Latest record timestamp ever appended (never regresses).
    pub fn last_timestamp(&self) -> DateTime<Utc> {
        self.lock_state().last_timestamp
    }

    /// Append a batch to the active file, one record per line.
    ///
    /// On error the counters stay untouched and the batch counts as not stored.
    pub fn append(&self, records: &[Record]) -> std::io::Result<()> {
        let Some(latest) = records.iter().map(|r| r.timestamp).max() else {
            return Ok(());
        };

        let mut buf = String::with_capacity(self.buffer_increment);
        for record in records {
            buf.push_str(&record.raw);
            buf.push('\n');
        }

        let mut state = self.lock_state();
        if state.file.is_none() {
            state.file = Some(open_append(&self.path)?);
        }
        if let Some(file) = state.file.as_mut() {
            if let Err(e) = file.write_all(buf.as_bytes()) {
                tracing::error!(file = %self.path.display(), error = %e, "write failed");
                return Err(e);
            }
        }
        state.appended += records.len();
        if latest > state.last_timestamp {
            state.last_timestamp = latest;
        }
        tracing::debug!(file = %self.path.display(), entries = records.len(), "appended");
        Ok(())
    }

    /// Serialise rotation attempts. Held for the whole check → probe → swap.
    pub(crate) fn rotation_guard(&self) -> MutexGuard<'_, ()> {
        self.rotation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the active handle, rename the file to `retired` and reopen the
    /// active path. The reopen happens whether or not the rename worked so
    /// appenders always have a file. The counter resets only on success.
    ///
    /// Caller must hold [`rotation_guard`](Self::rotation_guard).
    pub(crate) fn swap(&self, retired: &Path) -> std::io::Result<usize> {
        let mut state = self.lock_state();
        drop(state.file.take());

        let renamed = std::fs::rename(&self.path, retired);

        match open_append(&self.path) {
            Ok(file) => state.file = Some(file),
            Err(e) => {
                tracing::error!(file = %self.path.display(), error = %e, "reopen failed, next append retries");
            }
        }

        renamed?;
        let rotated = state.appended;
        state.appended = 0;
        Ok(rotated)
    }

    fn lock_state(&self) -> MutexGuard<'_, SegmentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn count_lines(path: &Path) -> std::io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    for chunk in reader.split(b'\n') {
        chunk?;
        count += 1;
    }
    Ok(count)
}
