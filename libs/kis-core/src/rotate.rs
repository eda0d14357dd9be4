use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio_util::task::TaskTracker;

use crate::archive::Archiver;
use crate::error::RotateError;
use crate::naming::free_retired_name;
use crate::segment::ActiveSegment;

/// Result of one rotation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationResult {
    /// Retired file name (the candidate when nothing was rotated).
    pub path: PathBuf,
    /// Unix seconds used for naming and the archive date.
    pub rotated_at: i64,
    pub happened: bool,
}

/// Retires the active file once a threshold is reached and hands it to the
/// [`Archiver`].
pub struct Rotator {
    segment: Arc<ActiveSegment>,
    archiver: Arc<Archiver>,
    rotate_interval: usize,
    flush_min_records: usize,
    max_name_probes: u32,
    detached: TaskTracker,
    /// Retired names whose archival has not finished yet.
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    /// Unix seconds for naming.
    clock: fn() -> i64,
}

/// Keeps a retired name out of the free-name probe until dropped.
struct NameReservation {
    names: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for NameReservation {
    fn drop(&mut self) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

impl Rotator {
    pub fn new(
        segment: Arc<ActiveSegment>,
        archiver: Arc<Archiver>,
        rotate_interval: usize,
        flush_min_records: usize,
        max_name_probes: u32,
    ) -> Self {
        Self {
            segment,
            archiver,
            rotate_interval,
            flush_min_records,
            max_name_probes,
            detached: TaskTracker::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            clock: unix_now,
        }
    }

    /// Replace the naming clock.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn segment(&self) -> &Arc<ActiveSegment> {
        &self.segment
    }

    /// Rotate if `rotate_interval` records were appended. With `wait` the
    /// archival runs before returning, otherwise it is detached.
    pub async fn maybe_rotate(&self, wait: bool) -> Result<RotationResult, RotateError> {
        self.rotate_at(self.rotate_interval, wait).await
    }

    /// Rotate-and-wait with the flush threshold. Entry point for operator
    /// signals, inactivity and shutdown.
    pub async fn flush(&self) -> Result<RotationResult, RotateError> {
        self.rotate_at(self.flush_min_records, true).await
    }

    /// Archival pipelines currently running detached.
    pub fn detached_in_flight(&self) -> usize {
        self.detached.len()
    }

    /// Wait up to `timeout` for detached archival to finish. Returns false
    /// on timeout.
    pub async fn wait_detached(&self, timeout: Duration) -> bool {
        self.detached.close();
        let done = tokio::time::timeout(timeout, self.detached.wait()).await.is_ok();
        self.detached.reopen();
        done
    }

    async fn rotate_at(&self, threshold: usize, wait: bool) -> Result<RotationResult, RotateError> {
        let (result, reservation) = match self.swap_if_due(threshold)? {
            (result, Some(reservation)) => (result, reservation),
            (result, None) => return Ok(result),
        };

        let archiver = self.archiver.clone();
        let path = result.path.clone();
        let rotated_at = result.rotated_at;
        if wait {
            archiver.archive(path, rotated_at).await?;
            drop(reservation);
        } else {
            self.detached.spawn(async move {
                if let Err(e) = archiver.archive(path.clone(), rotated_at).await {
                    tracing::error!(file = %path.display(), error = %e, "archival failed");
                }
                drop(reservation);
            });
        }
        Ok(result)
    }

    /// Threshold check, name probe, swap and name reservation, all under the
    /// rotation lock.
    fn swap_if_due(&self, threshold: usize) -> Result<(RotationResult, Option<NameReservation>), RotateError> {
        let _rotation = self.segment.rotation_guard();

        let rotated_at = (self.clock)();
        let active = self.segment.path();
        let appended = self.segment.appended();
        if appended < threshold {
            let result = RotationResult {
                path: active.to_path_buf(),
                rotated_at,
                happened: false,
            };
            return Ok((result, None));
        }

        let retired = {
            let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            free_retired_name(active, rotated_at, self.max_name_probes, &in_flight)?
        };
        tracing::info!(events = appended, file = %retired.display(), "rotating active file");

        self.segment
            .swap(&retired)
            .map_err(|source| RotateError::Rename {
                from: active.to_path_buf(),
                to: retired.clone(),
                source,
            })?;

        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(retired.clone());
        let reservation = NameReservation {
            names: self.in_flight.clone(),
            path: retired.clone(),
        };

        Ok((RotationResult { path: retired, rotated_at, happened: true }, Some(reservation)))
    }
}
