//! Size-triggered rotation of agent output logs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Files at or above this size are rotated.
pub const ROTATE_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

const LOG_SUFFIX: &str = ".log";
const MAX_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct Rotator {
    dir: PathBuf,
    threshold: u64,
}

impl Rotator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            threshold: ROTATE_THRESHOLD_BYTES,
        }
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn rotate(&self) -> Vec<PathBuf> {
        self.rotate_at(Utc::now())
    }

    /// Rename every oversized `*.log` under the directory to `<name>.log.<timestamp>`.
    /// Returns the new paths. A missing directory rotates nothing.
    pub fn rotate_at(&self, now: DateTime<Utc>) -> Vec<PathBuf> {
        if !self.dir.is_dir() {
            return Vec::new();
        }

        let mut rotated = Vec::new();
        let walker = WalkDir::new(&self.dir)
            .max_depth(MAX_DEPTH)
            .follow_links(false)
            .into_iter();

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if !entry.file_name().to_string_lossy().ends_with(LOG_SUFFIX) {
                continue;
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(error) => {
                    warn!(target = "fleetd::rotate", path = %entry.path().display(), error = %error, "failed reading log size");
                    continue;
                }
            };
            if size < self.threshold {
                continue;
            }

            let target = rotated_path(entry.path(), now);
            match std::fs::rename(entry.path(), &target) {
                Ok(()) => {
                    info!(target = "fleetd::rotate", from = %entry.path().display(), to = %target.display(), size, "rotated log");
                    rotated.push(target);
                }
                Err(error) => {
                    warn!(target = "fleetd::rotate", path = %entry.path().display(), error = %error, "failed rotating log");
                }
            }
        }
        rotated
    }
}

fn rotated_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let stamp = now.format("%Y%m%d-%H%M%S%.3f");
    let base = format!("{}.{stamp}", path.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{n}"));
        n += 1;
    }
    candidate
}
