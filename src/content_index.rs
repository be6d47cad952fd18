//! The content-addressed index: `digest -> set of paths`, with an inverse `path ->
//! digest` map for O(1) removal by path, plus the empty-file register. Both are
//! independently thread-safe (own internal mutual-exclusion region) per the supervisor's
//! "no component holds more than one region at a time" discipline.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

/// What the index knows about one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub filename: String,
    pub digest: String,
    pub size: u64,
    pub last_modified: String,
    pub file_id: u64,
}

/// Builds a `FileRecord` for `path` carrying `digest`, reading size/mtime/identity fresh
/// from the filesystem.
pub fn build_record(path: &Path, digest: String) -> io::Result<FileRecord> {
    let metadata = std::fs::metadata(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let last_modified = metadata
        .modified()
        .map(|t| {
            let datetime: chrono::DateTime<Utc> = t.into();
            datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
        })
        .unwrap_or_else(|_| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    Ok(FileRecord {
        path: path.to_path_buf(),
        filename,
        digest,
        size: metadata.len(),
        last_modified,
        file_id: file_identity(path, &metadata),
    })
}

#[cfg(unix)]
fn file_identity(_path: &Path, metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    // Fold the 64-bit device id and the 64-bit inode number into one stable 64-bit
    // identifier composed from the volume identifier and the filesystem's file index.
    let dev = metadata.dev();
    let ino = metadata.ino();
    dev.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ ino
}

#[cfg(windows)]
fn file_identity(path: &Path, _metadata: &std::fs::Metadata) -> u64 {
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::{
        GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION,
    };

    let Ok(file) = std::fs::File::open(path) else {
        return 0;
    };
    let _ = path.as_os_str().encode_wide().count();
    let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
    let handle = file.as_raw_handle() as windows_sys::Win32::Foundation::HANDLE;
    let ok = unsafe { GetFileInformationByHandle(handle, &mut info) };
    if ok == 0 {
        return 0;
    }
    let volume = info.dwVolumeSerialNumber as u64;
    let index = ((info.nFileIndexHigh as u64) << 32) | info.nFileIndexLow as u64;
    volume.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ index
}

#[derive(Debug)]
struct Bucket {
    records: HashMap<PathBuf, FileRecord>,
}

struct ContentIndexInner {
    buckets: HashMap<String, Bucket>,
    by_path: HashMap<PathBuf, String>,
}

/// Thread-safe mapping from digest to the set of paths currently known to carry that
/// content, with the inverse `path -> digest` lookup for O(1) removal.
///
/// Invariants upheld by construction:
/// - (I1) every path appears in at most one digest bucket — enforced by `insert`, which
///   removes any prior mapping for the path before inserting the new one.
/// - (I3) a record's `digest` field equals the bucket key it is stored under.
pub struct ContentIndex {
    inner: Mutex<ContentIndexInner>,
}

impl Default for ContentIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentIndex {
    pub fn new() -> Self {
        ContentIndex {
            inner: Mutex::new(ContentIndexInner {
                buckets: HashMap::new(),
                by_path: HashMap::new(),
            }),
        }
    }

    /// Atomically inserts `record` under `record.digest`. If `record.path` was already
    /// present under a different digest, that prior mapping is removed first (I1).
    pub fn insert(&self, record: FileRecord) {
        let mut inner = self.inner.lock().expect("content index poisoned");
        if let Some(prior_digest) = inner.by_path.get(&record.path).cloned()
            && prior_digest != record.digest
            && let Some(bucket) = inner.buckets.get_mut(&prior_digest)
        {
            bucket.records.remove(&record.path);
            if bucket.records.is_empty() {
                inner.buckets.remove(&prior_digest);
            }
        }
        inner.by_path.insert(record.path.clone(), record.digest.clone());
        inner
            .buckets
            .entry(record.digest.clone())
            .or_insert_with(|| Bucket { records: HashMap::new() })
            .records
            .insert(record.path.clone(), record);
    }

    /// Atomically removes any record for `path`; no-op if absent. Returns the prior
    /// digest if the path was present.
    pub fn remove_by_path(&self, path: &Path) -> Option<String> {
        let mut inner = self.inner.lock().expect("content index poisoned");
        let digest = inner.by_path.remove(path)?;
        if let Some(bucket) = inner.buckets.get_mut(&digest) {
            bucket.records.remove(path);
            if bucket.records.is_empty() {
                inner.buckets.remove(&digest);
            }
        }
        Some(digest)
    }

    pub fn digest_for_path(&self, path: &Path) -> Option<String> {
        let inner = self.inner.lock().expect("content index poisoned");
        inner.by_path.get(path).cloned()
    }

    /// A snapshot-copy of all records sharing `digest` except `excluding`, safe to use
    /// outside the lock.
    pub fn duplicates_for(&self, digest: &str, excluding: &Path) -> Vec<FileRecord> {
        let inner = self.inner.lock().expect("content index poisoned");
        match inner.buckets.get(digest) {
            Some(bucket) => bucket
                .records
                .values()
                .filter(|r| r.path != excluding)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of digests whose bucket currently has cardinality >= 2.
    pub fn all_groups(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("content index poisoned");
        inner
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.records.len() >= 2)
            .map(|(digest, _)| digest.clone())
            .collect()
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        let inner = self.inner.lock().expect("content index poisoned");
        inner.by_path.contains_key(path)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("content index poisoned");
        inner.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ContentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentIndex").finish_non_exhaustive()
    }
}

/// The set of absolute paths currently observed to be zero bytes. Disjoint from the
/// `ContentIndex` path domain (E1); never contains duplicates (E2).
#[derive(Debug, Default)]
pub struct EmptyFileSet {
    inner: Mutex<Vec<PathBuf>>,
}

impl EmptyFileSet {
    pub fn new() -> Self {
        EmptyFileSet::default()
    }

    pub fn add(&self, path: PathBuf) {
        let mut inner = self.inner.lock().expect("empty file set poisoned");
        if !inner.contains(&path) {
            inner.push(path);
        }
    }

    pub fn remove(&self, path: &Path) {
        let mut inner = self.inner.lock().expect("empty file set poisoned");
        inner.retain(|p| p != path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        let inner = self.inner.lock().expect("empty file set poisoned");
        inner.contains(&path.to_path_buf())
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("empty file set poisoned");
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
