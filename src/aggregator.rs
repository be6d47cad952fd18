//! Per-digest group objects capturing the canonical duplicate alert for each content
//! hash seen since process start; updated as files join/leave groups.

use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;

use crate::content_index::FileRecord;
use crate::ipc::{duplicate_detected_message, scan_complete_message, OutboundHandle};

pub const GROUP_CAPACITY: usize = 100;
pub const MAX_RECORDS_PER_GROUP: usize = 100;

/// Per-digest aggregate. A group owns its records by value — no cyclic reference between
/// group and record, unlike the original prototype's embedded layout.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub digest: String,
    pub records: Vec<FileRecord>,
    pub last_updated: String,
    pub delivered: bool,
}

impl DuplicateGroup {
    /// A group is active iff at least two of its recorded files still exist on disk.
    fn extant_count(&self) -> usize {
        self.records.iter().filter(|r| r.path.exists()).count()
    }
}

pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct AggregatorInner {
    groups: IndexMap<String, DuplicateGroup>,
}

/// Maintains the capacity-bounded collection of `DuplicateGroup`s keyed by digest.
pub struct Aggregator {
    inner: Mutex<AggregatorInner>,
    outbound: OutboundHandle,
}

/// Merges `incoming` into `records` by path-uniqueness (G2). Returns whether anything
/// actually changed — re-observing a path already present with an identical record
/// (unchanged digest, size, mtime, file id) is a no-op, not an update.
fn merge_record(records: &mut Vec<FileRecord>, incoming: FileRecord) -> bool {
    if let Some(existing) = records.iter_mut().find(|r| r.path == incoming.path) {
        if *existing == incoming {
            false
        } else {
            *existing = incoming;
            true
        }
    } else {
        records.push(incoming);
        true
    }
}

impl Aggregator {
    pub fn new(outbound: OutboundHandle) -> Self {
        Aggregator {
            inner: Mutex::new(AggregatorInner { groups: IndexMap::new() }),
            outbound,
        }
    }

    /// Finds or creates the group for `trigger.digest`, merges `trigger` and every
    /// `others` record into it by path-uniqueness (G2), and — if the group now holds >=
    /// 2 records — emits it via the IPC layer and marks `delivered = true` on success.
    pub fn on_duplicate(&self, trigger: FileRecord, others: Vec<FileRecord>, timestamp: String) {
        let digest = trigger.digest.clone();
        let snapshot = {
            let mut inner = self.inner.lock().expect("aggregator poisoned");
            if !inner.groups.contains_key(&digest) && inner.groups.len() >= GROUP_CAPACITY {
                // Oldest group evicted first; a connected client's replay position
                // naturally follows since eviction happens before this push.
                inner.groups.shift_remove_index(0);
            }
            let group = inner.groups.entry(digest.clone()).or_insert_with(|| DuplicateGroup {
                digest: digest.clone(),
                records: Vec::new(),
                last_updated: timestamp.clone(),
                delivered: false,
            });
            let mut changed = merge_record(&mut group.records, trigger);
            for record in others {
                changed |= merge_record(&mut group.records, record);
            }
            if group.records.len() > MAX_RECORDS_PER_GROUP {
                group.records.truncate(MAX_RECORDS_PER_GROUP);
            }
            group.last_updated = timestamp;
            if changed && group.records.len() >= 2 {
                Some(group.clone())
            } else {
                None
            }
        };

        if let Some(group) = snapshot {
            let message = duplicate_detected_message(&group);
            let delivered = self.outbound.send(message);
            if delivered {
                let mut inner = self.inner.lock().expect("aggregator poisoned");
                if let Some(g) = inner.groups.get_mut(&group.digest) {
                    g.delivered = true;
                }
            }
        }
    }

    pub fn on_scan_complete(&self, total_files: usize, total_groups: usize, timestamp: String) {
        self.outbound.send(scan_complete_message(total_files, total_groups, timestamp));
    }

    /// Strips `path` from whatever group(s) currently list it — the path's digest has
    /// changed (rewrite-in-place) or the path no longer exists. A group may drop below
    /// the active threshold as a result; it stays in the map (groups live for the
    /// process lifetime) so a stale record never keeps surfacing as an active duplicate.
    pub fn remove_path(&self, path: &std::path::Path) {
        let mut inner = self.inner.lock().expect("aggregator poisoned");
        for group in inner.groups.values_mut() {
            group.records.retain(|r| r.path != path);
        }
    }

    /// Re-marks every group `delivered = false` so reconnection replays them.
    pub fn on_client_disconnect(&self) {
        let mut inner = self.inner.lock().expect("aggregator poisoned");
        for group in inner.groups.values_mut() {
            group.delivered = false;
        }
    }

    /// Called by the IPC accept loop right after a client connects. Returns, in
    /// insertion order, every group with >= 2 still-existing files (rechecked by stat at
    /// replay time), marking each `delivered = true`.
    pub fn replay_snapshot(&self) -> Vec<DuplicateGroup> {
        let mut inner = self.inner.lock().expect("aggregator poisoned");
        let mut out = Vec::new();
        for group in inner.groups.values_mut() {
            if group.extant_count() >= 2 {
                group.delivered = true;
                out.push(group.clone());
            }
        }
        out
    }

    #[cfg(test)]
    fn group(&self, digest: &str) -> Option<DuplicateGroup> {
        self.inner.lock().expect("aggregator poisoned").groups.get(digest).cloned()
    }

    #[cfg(test)]
    fn group_count(&self) -> usize {
        self.inner.lock().expect("aggregator poisoned").groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc;
    use tempfile::tempdir;

    fn record(path: std::path::PathBuf, digest: &str) -> FileRecord {
        FileRecord {
            path,
            filename: "f".to_string(),
            digest: digest.to_string(),
            size: 4,
            last_modified: "2024-01-01T00:00:00.000Z".to_string(),
            file_id: 1,
        }
    }

    fn aggregator() -> Aggregator {
        let (handle, _rx, _connected) = ipc::channel();
        Aggregator::new(handle)
    }

    #[test]
    fn single_record_group_does_not_surface() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        std::fs::write(&a, b"x").unwrap();
        let agg = aggregator();
        agg.on_duplicate(record(a, "abc"), vec![], now_iso8601());
        assert_eq!(agg.group_count(), 1);
        assert_eq!(agg.group("abc").unwrap().records.len(), 1);
    }

    #[test]
    fn two_records_form_an_active_group() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        let agg = aggregator();
        agg.on_duplicate(record(a, "abc"), vec![record(b, "abc")], now_iso8601());
        assert_eq!(agg.group("abc").unwrap().records.len(), 2);
    }

    #[test]
    fn merge_is_path_unique() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        let agg = aggregator();
        agg.on_duplicate(record(a.clone(), "abc"), vec![record(b.clone(), "abc")], now_iso8601());
        agg.on_duplicate(record(a, "abc"), vec![record(b, "abc")], now_iso8601());
        assert_eq!(agg.group("abc").unwrap().records.len(), 2);
    }

    #[test]
    fn capacity_eviction_drops_oldest() {
        let dir = tempdir().unwrap();
        let agg = aggregator();
        for i in 0..GROUP_CAPACITY {
            let a = dir.path().join(format!("a{i}.bin"));
            let b = dir.path().join(format!("b{i}.bin"));
            std::fs::write(&a, b"x").unwrap();
            std::fs::write(&b, b"x").unwrap();
            let digest = format!("digest{i}");
            agg.on_duplicate(record(a, &digest), vec![record(b, &digest)], now_iso8601());
        }
        assert_eq!(agg.group_count(), GROUP_CAPACITY);
        assert!(agg.group("digest0").is_some());

        let a = dir.path().join("a_new.bin");
        let b = dir.path().join("b_new.bin");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        agg.on_duplicate(record(a, "digest_new"), vec![record(b, "digest_new")], now_iso8601());

        assert_eq!(agg.group_count(), GROUP_CAPACITY);
        assert!(agg.group("digest0").is_none(), "oldest group should have been evicted");
        assert!(agg.group("digest_new").is_some());
    }

    #[test]
    fn replay_snapshot_excludes_groups_with_fewer_than_two_extant_files() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        let agg = aggregator();
        agg.on_duplicate(record(a.clone(), "abc"), vec![record(b.clone(), "abc")], now_iso8601());
        std::fs::remove_file(&b).unwrap();
        assert!(agg.replay_snapshot().is_empty());
    }

    #[test]
    fn disconnect_marks_all_groups_undelivered() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        let agg = aggregator();
        agg.on_duplicate(record(a, "abc"), vec![record(b, "abc")], now_iso8601());
        agg.on_client_disconnect();
        assert!(!agg.group("abc").unwrap().delivered);
    }
}
