use crate::io::publisher::parse_filename_stamp;
use crate::types::GvResult;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};

/// Outcome of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    pub kept: usize,
    /// Images whose name carries no parseable timestamp
    pub skipped: Vec<String>,
}

/// Age-based deletion of published images
pub struct RetentionSweeper {
    output_dir: PathBuf,
    max_age: Duration,
}

impl RetentionSweeper {
    pub fn new<P: AsRef<Path>>(output_dir: P, max_age: Duration) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            max_age,
        }
    }

    /// Delete every image older than the retention window at `now`
    pub fn sweep(&self, now: DateTime<Utc>) -> GvResult<SweepReport> {
        let mut report = SweepReport::default();
        if !self.output_dir.exists() {
            return Ok(report);
        }

        // A window reaching past the representable range expires nothing
        let cutoff = now.checked_sub_signed(self.max_age);
        for entry in std::fs::read_dir(&self.output_dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            // Hidden entries are in-flight temp files or lock markers
            if !name.ends_with(".png") || name.starts_with('.') {
                continue;
            }

            match parse_filename_stamp(&name) {
                Some(stamp) if cutoff.map_or(false, |c| stamp < c) => {
                    log::info!("Removing expired image {}", name);
                    std::fs::remove_file(entry.path())?;
                    report.deleted.push(name);
                }
                Some(_) => report.kept += 1,
                None => {
                    log::warn!("Cannot parse timestamp from {}, leaving it in place", name);
                    report.skipped.push(name);
                }
            }
        }

        log::debug!(
            "Retention sweep: {} deleted, {} kept, {} skipped",
            report.deleted.len(),
            report.kept,
            report.skipped.len()
        );
        Ok(report)
    }
}
