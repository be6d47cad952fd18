//! One-shot recursive directory traversal that populates the index and emits per-file
//! progress. Runs concurrently with the watcher.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use jwalk::WalkDir;

use crate::aggregator::{now_iso8601, Aggregator};
use crate::classifier::is_ignored;
use crate::content_index::{ContentIndex, EmptyFileSet};
use crate::intake::process_candidate_file;

#[derive(Debug)]
pub enum ScanError {
    Io(io::Error),
    Cancelled,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Io(e) => write!(f, "scan: {e}"),
            ScanError::Cancelled => write!(f, "scan: cancelled"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Io(e) => Some(e),
            ScanError::Cancelled => None,
        }
    }
}

impl From<io::Error> for ScanError {
    fn from(e: io::Error) -> Self {
        ScanError::Io(e)
    }
}

/// Shared progress counters, safe to read from another thread while the scan runs.
#[derive(Debug, Default)]
pub struct ScanProgress {
    pub files_scanned: AtomicU64,
    pub duplicate_files_seen: AtomicU64,
}

/// Handle returned to callers that want to cancel an in-flight scan.
#[derive(Clone)]
pub struct ScanHandle {
    progress: Arc<ScanProgress>,
    cancelled: Arc<AtomicBool>,
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> (u64, u64) {
        (
            self.progress.files_scanned.load(Ordering::Relaxed),
            self.progress.duplicate_files_seen.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub total_files: u64,
    pub duplicate_groups: u64,
    pub duration_ms: u128,
    pub was_cancelled: bool,
}

/// Walks `root` depth-first, processing every kept regular file per `process_candidate_file`
/// (spec §4.5 step 1-2), checking `handle` for cancellation between entries. On
/// (non-cancelled) completion, invokes the aggregator's scan-complete emitter with totals.
pub fn scan_volume(
    root: &Path,
    content_index: &ContentIndex,
    empty_files: &EmptyFileSet,
    aggregator: &Aggregator,
    handle: ScanHandle,
) -> Result<ScanSummary, ScanError> {
    let started = Instant::now();
    let mut files_scanned: u64 = 0;
    let mut cancelled = false;

    log::info!("[SCAN] watching {}", root.display());

    for entry in WalkDir::new(root).skip_hidden(false) {
        if handle.is_cancelled() {
            cancelled = true;
            break;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("[ERROR] scan walk error: {e}");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }
        if !entry.file_type().is_file() {
            // symlinks and other special entries: not guaranteed to be traversed (non-goal).
            continue;
        }

        let path: PathBuf = entry.path();
        let name = entry.file_name().to_string_lossy();
        if is_ignored(&name) {
            continue;
        }

        let outcome = process_candidate_file(&path, "SCAN", content_index, empty_files, aggregator);
        files_scanned += 1;
        handle.progress.files_scanned.store(files_scanned, Ordering::Relaxed);
        if matches!(outcome, crate::intake::ProcessOutcome::Processed { is_duplicate: true }) {
            handle.progress.duplicate_files_seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    let duplicate_groups = content_index.all_groups().len() as u64;
    if !cancelled {
        aggregator.on_scan_complete(files_scanned as usize, duplicate_groups as usize, now_iso8601());
    }

    Ok(ScanSummary {
        total_files: files_scanned,
        duplicate_groups,
        duration_ms: started.elapsed().as_millis(),
        was_cancelled: cancelled,
    })
}

pub fn new_handle() -> ScanHandle {
    ScanHandle {
        progress: Arc::new(ScanProgress::default()),
        cancelled: Arc::new(AtomicBool::new(false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc;
    use tempfile::tempdir;

    fn harness() -> (ContentIndex, EmptyFileSet, Aggregator) {
        let (outbound, _rx, _connected) = ipc::channel();
        (ContentIndex::new(), EmptyFileSet::new(), Aggregator::new(outbound))
    }

    #[test]
    fn scans_nested_directories_and_finds_duplicates() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/one.bin"), b"dup").unwrap();
        std::fs::write(dir.path().join("a/b/two.bin"), b"dup").unwrap();
        std::fs::write(dir.path().join("unique.bin"), b"singleton").unwrap();

        let (index, empty, agg) = harness();
        let summary = scan_volume(dir.path(), &index, &empty, &agg, new_handle()).unwrap();

        assert_eq!(summary.total_files, 3);
        assert_eq!(summary.duplicate_groups, 1);
        assert!(!summary.was_cancelled);
    }

    #[test]
    fn ignored_files_are_skipped() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keep.bin"), b"data").unwrap();
        std::fs::write(dir.path().join("~$locked.docx"), b"data").unwrap();
        std::fs::write(dir.path().join("Thumbs.db"), b"data").unwrap();

        let (index, empty, agg) = harness();
        let summary = scan_volume(dir.path(), &index, &empty, &agg, new_handle()).unwrap();

        assert_eq!(summary.total_files, 1);
        assert!(index.contains_path(&dir.path().join("keep.bin")));
    }

    #[test]
    fn zero_byte_files_go_to_empty_set() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("empty1"), b"").unwrap();
        std::fs::write(dir.path().join("empty2"), b"").unwrap();

        let (index, empty, agg) = harness();
        scan_volume(dir.path(), &index, &empty, &agg, new_handle()).unwrap();

        assert_eq!(empty.len(), 2);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn cancellation_stops_the_walk_early() {
        let dir = tempdir().unwrap();
        for i in 0..20 {
            std::fs::write(dir.path().join(format!("f{i}.bin")), format!("content-{i}")).unwrap();
        }
        let (index, empty, agg) = harness();
        let handle = new_handle();
        handle.cancel();
        let summary = scan_volume(dir.path(), &index, &empty, &agg, handle).unwrap();
        assert!(summary.was_cancelled);
        assert_eq!(summary.total_files, 0);
    }

    #[test]
    fn empty_directory_scans_cleanly() {
        let dir = tempdir().unwrap();
        let (index, empty, agg) = harness();
        let summary = scan_volume(dir.path(), &index, &empty, &agg, new_handle()).unwrap();
        assert_eq!(summary.total_files, 0);
        assert_eq!(summary.duplicate_groups, 0);
        assert!(index.is_empty());
    }
}
