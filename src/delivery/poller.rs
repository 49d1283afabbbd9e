//! Poll-mode coordinator
//!
//! Lists the current hour of the product prefix (or the previous hour when the
//! current one is still empty) and runs the pipeline for every object not
//! already claimed by a lock marker. Markers only guard against re-entry on
//! one host; runs must be serialized externally.

use super::{is_eligible, Outcome, UnitProcessor};
use crate::io::object_store::{ObjectStore, ObjectSummary};
use crate::types::{GvResult, SourceRef};
use chrono::{DateTime, Duration, Utc};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Empty sentinel file claiming one source timestamp
#[derive(Debug)]
pub struct LockMarker {
    path: PathBuf,
    owned: bool,
}

impl LockMarker {
    /// Marker path for a source last-modified stamp
    pub fn path_for(lock_dir: &Path, stamp: DateTime<Utc>) -> PathBuf {
        lock_dir.join(format!("{}.lock", stamp.format("%Y%m%dT%H%M%SZ")))
    }

    /// Create the marker, or `None` when it already exists
    pub fn try_acquire(lock_dir: &Path, stamp: DateTime<Utc>) -> GvResult<Option<Self>> {
        let path = Self::path_for(lock_dir, stamp);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                log::debug!("Created lock marker {}", path.display());
                Ok(Some(Self { path, owned: true }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker (also done on drop)
    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("Failed to remove lock marker {}: {}", self.path.display(), e);
            }
            self.owned = false;
        }
    }
}

impl Drop for LockMarker {
    fn drop(&mut self) {
        self.release();
    }
}

/// Counts from one poll run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub listed: usize,
    pub locked: usize,
    pub published: usize,
    pub already_published: usize,
    pub failed: usize,
}

/// Lists one bucket and processes new objects
pub struct Poller<P> {
    store: Arc<dyn ObjectStore>,
    processor: Arc<P>,
    bucket: String,
    prefix: String,
    lock_dir: PathBuf,
}

impl<P: UnitProcessor> Poller<P> {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        processor: Arc<P>,
        bucket: &str,
        prefix: &str,
        lock_dir: &Path,
    ) -> Self {
        Self {
            store,
            processor,
            bucket: bucket.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
            lock_dir: lock_dir.to_path_buf(),
        }
    }

    /// Listing prefix for the hour containing `at`
    pub fn hour_prefix(&self, at: DateTime<Utc>) -> String {
        format!("{}/{}/", self.prefix, at.format("%Y/%j/%H"))
    }

    /// Objects of the current hour, or of the previous hour if none exist yet
    pub fn candidates(&self, now: DateTime<Utc>) -> GvResult<Vec<ObjectSummary>> {
        let current = self.hour_prefix(now);
        let objects = self.store.list(&self.bucket, &current)?;
        if !objects.is_empty() {
            return Ok(objects);
        }
        let previous = self.hour_prefix(now - Duration::hours(1));
        log::info!("No objects under {} yet, listing {}", current, previous);
        self.store.list(&self.bucket, &previous)
    }

    /// One scheduled run; per-unit failures are counted, not raised
    pub fn run_once(&self, now: DateTime<Utc>) -> GvResult<PollSummary> {
        fs::create_dir_all(&self.lock_dir)?;
        let mut summary = PollSummary::default();

        for object in self.candidates(now)? {
            summary.listed += 1;
            let unit = SourceRef::new(self.bucket.as_str(), object.key).with_last_modified(object.last_modified);
            if !is_eligible(&unit, &self.prefix) {
                log::debug!("Ignoring {}", unit);
                continue;
            }

            let mut marker = match LockMarker::try_acquire(&self.lock_dir, object.last_modified)? {
                Some(marker) => marker,
                None => {
                    log::info!("Lock marker exists for {}, skipping", unit);
                    summary.locked += 1;
                    continue;
                }
            };

            match self.processor.process(&unit) {
                Ok(Outcome::Published(_)) => summary.published += 1,
                Ok(Outcome::AlreadyPublished(_)) => summary.already_published += 1,
                Err(e) => {
                    log::error!("Failed to process {}: {}", unit, e);
                    summary.failed += 1;
                }
            }
            marker.release();
        }

        match self.processor.sweep_expired(now) {
            Ok(report) => log::debug!("Removed {} expired images", report.deleted.len()),
            Err(e) => log::error!("Retention sweep failed: {}", e),
        }

        log::info!(
            "Poll run: {} listed, {} published, {} already published, {} locked, {} failed",
            summary.listed,
            summary.published,
            summary.already_published,
            summary.locked,
            summary.failed
        );
        Ok(summary)
    }
}
