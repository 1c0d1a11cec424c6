//! Forensic snapshots taken when the store is found corrupted.
//!
//! Each snapshot is a directory `snap-<index>-<timestamp>` holding a byte
//! copy of the log and, when present, the stored roadmap. Retention is
//! bounded; the oldest snapshots are evicted first.

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const PREFIX: &str = "snap-";

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    max_snapshots: usize,
}

impl SnapshotStore {
    /// `max_snapshots` below 1 is treated as 1.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_snapshots: usize) -> Self {
        Self {
            dir: dir.into(),
            max_snapshots: max_snapshots.max(1),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Existing snapshots, oldest first.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut snapshots: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if let Some(index) = path.file_name().and_then(|n| n.to_str()).and_then(index_of) {
                snapshots.push((index, path));
            }
        }
        snapshots.sort();
        Ok(snapshots.into_iter().map(|(_, path)| path).collect())
    }

    /// Copies the log (and roadmap, if any) into a new snapshot and evicts
    /// the oldest ones beyond the retention bound.
    pub fn capture(
        &self,
        at: DateTime<Utc>,
        log: &[u8],
        roadmap: Option<&[u8]>,
    ) -> io::Result<PathBuf> {
        let existing = self.list()?;
        let next = existing
            .last()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(index_of)
            .map_or(1, |i| i + 1);

        let target = self
            .dir
            .join(format!("{PREFIX}{next:06}-{}", at.format("%Y%m%dT%H%M%SZ")));
        fs::create_dir_all(&target)?;
        fs::write(target.join("activity.jsonl"), log)?;
        if let Some(roadmap) = roadmap {
            fs::write(target.join("roadmap.json"), roadmap)?;
        }
        info!(snapshot = %target.display(), bytes = log.len(), "store snapshot captured");

        let mut all = existing;
        all.push(target.clone());
        let excess = all.len().saturating_sub(self.max_snapshots);
        for old in all.iter().take(excess) {
            if let Err(e) = fs::remove_dir_all(old) {
                warn!(snapshot = %old.display(), error = %e, "failed to evict snapshot");
            }
        }
        Ok(target)
    }
}

fn index_of(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?.split('-').next()?.parse().ok()
}
