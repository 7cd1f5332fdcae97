//! Transactional key-value collaborator underneath the message store.
//!
//! Data lives in named buckets of byte keys and byte values. `update` runs a
//! closure against a [`Transaction`] whose writes are applied only if the
//! closure returns `Ok`; `view` gets a read-only [`Snapshot`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;
type Buckets = BTreeMap<String, Bucket>;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

pub type UpdateFn<'f> = dyn FnMut(&mut Transaction<'_>) -> Result<()> + 'f;
pub type ViewFn<'f> = dyn FnMut(&Snapshot<'_>) -> Result<()> + 'f;

pub trait KvStore: Send + Sync + std::fmt::Debug {
    fn update(&self, f: &mut UpdateFn<'_>) -> Result<()>;
    fn view(&self, f: &mut ViewFn<'_>) -> Result<()>;
}

/// Read-only view over committed buckets.
pub struct Snapshot<'a> {
    buckets: &'a Buckets,
}

impl<'a> Snapshot<'a> {
    pub fn get(&self, bucket: &str, key: &[u8]) -> Option<&'a [u8]> {
        self.buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(Vec::as_slice)
    }

    pub fn buckets(&self) -> impl Iterator<Item = &'a str> {
        self.buckets.keys().map(String::as_str)
    }

    pub fn scan(&self, bucket: &str) -> impl Iterator<Item = (&'a [u8], &'a [u8])> {
        self.buckets
            .get(bucket)
            .into_iter()
            .flat_map(|b| b.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))
    }
}

/// Pending writes layered over committed buckets.
pub struct Transaction<'a> {
    base: &'a Buckets,
    writes: BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    dropped: BTreeSet<String>,
}

/// Owned result of a finished transaction.
struct Changes {
    writes: BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    dropped: BTreeSet<String>,
}

impl<'a> Transaction<'a> {
    fn new(base: &'a Buckets) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
            dropped: BTreeSet::new(),
        }
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.writes.get(bucket).and_then(|w| w.get(key)) {
            return value.clone();
        }
        if self.dropped.contains(bucket) {
            return None;
        }
        self.base.get(bucket).and_then(|b| b.get(key)).cloned()
    }

    pub fn put(&mut self, bucket: &str, key: &[u8], value: Vec<u8>) {
        self.writes
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value));
    }

    pub fn delete(&mut self, bucket: &str, key: &[u8]) {
        self.writes
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), None);
    }

    /// Keys currently visible in `bucket`, pending writes included.
    pub fn keys(&self, bucket: &str) -> Vec<Vec<u8>> {
        let mut keys: BTreeSet<Vec<u8>> = BTreeSet::new();
        if !self.dropped.contains(bucket) {
            if let Some(base) = self.base.get(bucket) {
                keys.extend(base.keys().cloned());
            }
        }
        if let Some(writes) = self.writes.get(bucket) {
            for (key, value) in writes {
                if value.is_some() {
                    keys.insert(key.clone());
                } else {
                    keys.remove(key);
                }
            }
        }
        keys.into_iter().collect()
    }

    /// Remove a bucket and everything in it.
    pub fn delete_bucket(&mut self, bucket: &str) {
        self.writes.remove(bucket);
        self.dropped.insert(bucket.to_string());
    }

    fn into_changes(self) -> Changes {
        Changes {
            writes: self.writes,
            dropped: self.dropped,
        }
    }
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.dropped.is_empty()
    }

    fn apply(self, buckets: &mut Buckets) {
        for name in self.dropped {
            buckets.remove(&name);
        }
        for (name, writes) in self.writes {
            let bucket = buckets.entry(name.clone()).or_default();
            for (key, value) in writes {
                match value {
                    Some(value) => {
                        bucket.insert(key, value);
                    }
                    None => {
                        bucket.remove(&key);
                    }
                }
            }
            if bucket.is_empty() {
                buckets.remove(&name);
            }
        }
    }
}

/// Run `f` against `buckets`, committing only on success. Returns whether
/// anything changed.
fn run_update(buckets: &mut Buckets, f: &mut UpdateFn<'_>) -> Result<bool> {
    let mut tx = Transaction::new(buckets);
    f(&mut tx)?;
    let changes = tx.into_changes();
    if changes.is_empty() {
        return Ok(false);
    }
    changes.apply(buckets);
    Ok(true)
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    buckets: RwLock<Buckets>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn update(&self, f: &mut UpdateFn<'_>) -> Result<()> {
        let mut buckets = self.buckets.write();
        run_update(&mut buckets, f).map(|_| ())
    }

    fn view(&self, f: &mut ViewFn<'_>) -> Result<()> {
        let buckets = self.buckets.read();
        f(&Snapshot { buckets: &buckets })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    buckets: BTreeMap<String, Vec<(Vec<u8>, Vec<u8>)>>,
}

/// File-backed store: committed state is rewritten to a JSON snapshot after
/// every update that changes something. The snapshot is replaced atomically
/// via rename.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    buckets: RwLock<Buckets>,
}

impl FileKv {
    pub const FILE_NAME: &'static str = "warren.kv.json";

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);

        let mut buckets = Buckets::new();
        if path.exists() {
            let data = fs::read(&path)?;
            let file: SnapshotFile = serde_json::from_slice(&data)?;
            for (name, entries) in file.buckets {
                buckets.insert(name, entries.into_iter().collect());
            }
            info!(path = %path.display(), buckets = buckets.len(), "Loaded key-value snapshot");
        }

        Ok(Self {
            path,
            buckets: RwLock::new(buckets),
        })
    }

    fn write_snapshot(&self, buckets: &Buckets) -> Result<()> {
        let file = SnapshotFile {
            buckets: buckets
                .iter()
                .map(|(name, bucket)| {
                    let entries = bucket
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    (name.clone(), entries)
                })
                .collect(),
        };
        let data = serde_json::to_vec(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        let mut out = fs::File::create(&tmp)?;
        out.write_all(&data)?;
        out.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        debug!(bytes = data.len(), "Wrote key-value snapshot");
        Ok(())
    }
}

impl KvStore for FileKv {
    fn update(&self, f: &mut UpdateFn<'_>) -> Result<()> {
        let mut buckets = self.buckets.write();
        let mut staged = buckets.clone();
        if run_update(&mut staged, f)? {
            self.write_snapshot(&staged)?;
            *buckets = staged;
        }
        Ok(())
    }

    fn view(&self, f: &mut ViewFn<'_>) -> Result<()> {
        let buckets = self.buckets.read();
        f(&Snapshot { buckets: &buckets })
    }
}
