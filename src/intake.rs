//! Shared "process one candidate file" logic (spec §4.5 steps 1-2), called from both the
//! scanner and the watcher so the two producers agree on exactly what happens when a
//! kept file is (re)observed.

use std::path::Path;

use crate::aggregator::{now_iso8601, Aggregator};
use crate::content_index::{build_record, ContentIndex, EmptyFileSet};
use crate::digest::digest_file;

#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// File was zero bytes; added to the empty-file register, never hashed.
    Empty,
    /// File was hashed and inserted; `is_duplicate` is true if at least one other path
    /// already carried this digest (so the aggregator was notified).
    Processed { is_duplicate: bool },
    /// Stat or digest failed; logged and skipped, per the `IoError` recovery policy.
    Error,
}

/// Determines size; if zero, registers the path as empty and returns. Otherwise computes
/// the digest, inserts into the index, and — if the digest already had >= 1 other path —
/// feeds the aggregator. `label` is the bracketed console tag (`SCAN`, `ADDED`,
/// `MODIFIED`) the caller wants attributed to this observation.
pub fn process_candidate_file(
    path: &Path,
    label: &str,
    content_index: &ContentIndex,
    empty_files: &EmptyFileSet,
    aggregator: &Aggregator,
) -> ProcessOutcome {
    let size = match std::fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            log::warn!("[ERROR] stat failed for {}: {e}", path.display());
            return ProcessOutcome::Error;
        }
    };

    if size == 0 {
        log::info!("[{label}] {} (0 bytes - skipped)", path.display());
        content_index.remove_by_path(path);
        empty_files.add(path.to_path_buf());
        return ProcessOutcome::Empty;
    }
    empty_files.remove(path);

    let digest = match digest_file(path) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("[ERROR] digest failed for {}: {e}", path.display());
            return ProcessOutcome::Error;
        }
    };

    let record = match build_record(path, digest.clone()) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("[ERROR] stat failed for {}: {e}", path.display());
            return ProcessOutcome::Error;
        }
    };

    log::info!("[{label}] {}", path.display());
    let others = content_index.duplicates_for(&digest, path);
    content_index.insert(record.clone());

    if others.is_empty() {
        ProcessOutcome::Processed { is_duplicate: false }
    } else {
        aggregator.on_duplicate(record, others, now_iso8601());
        ProcessOutcome::Processed { is_duplicate: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc;
    use tempfile::tempdir;

    fn harness() -> (ContentIndex, EmptyFileSet, Aggregator) {
        let (handle, _rx, _connected) = ipc::channel();
        (ContentIndex::new(), EmptyFileSet::new(), Aggregator::new(handle))
    }

    #[test]
    fn empty_file_goes_to_empty_set_not_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        let (index, empty, agg) = harness();
        let outcome = process_candidate_file(&path, "SCAN", &index, &empty, &agg);
        assert_eq!(outcome, ProcessOutcome::Empty);
        assert!(empty.contains(&path));
        assert!(!index.contains_path(&path));
    }

    #[test]
    fn first_observation_of_unique_content_is_not_a_duplicate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        let (index, empty, agg) = harness();
        let outcome = process_candidate_file(&path, "SCAN", &index, &empty, &agg);
        assert_eq!(outcome, ProcessOutcome::Processed { is_duplicate: false });
        assert!(index.contains_path(&path));
    }

    #[test]
    fn second_observation_of_same_content_is_a_duplicate() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"hello").unwrap();
        std::fs::write(&b, b"hello").unwrap();
        let (index, empty, agg) = harness();
        process_candidate_file(&a, "SCAN", &index, &empty, &agg);
        let outcome = process_candidate_file(&b, "SCAN", &index, &empty, &agg);
        assert_eq!(outcome, ProcessOutcome::Processed { is_duplicate: true });
    }

    #[test]
    fn reprocessing_same_path_without_modification_is_a_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        let (index, empty, agg) = harness();
        process_candidate_file(&path, "SCAN", &index, &empty, &agg);
        let digest_before = index.digest_for_path(&path);
        process_candidate_file(&path, "SCAN", &index, &empty, &agg);
        assert_eq!(index.digest_for_path(&path), digest_before);
        assert_eq!(index.len(), 1);
    }
}
