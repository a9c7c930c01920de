//! This module implements the problem data-pack cache: single-flight
//! download and extraction of tar.zstd bundles with LRU, TTL and size based
//! eviction.
//!
//! Entries returned by `get` are pinned by a refcount for as long as the
//! returned handle lives; eviction skips pinned entries, so a concurrent
//! judging never loses the files under its feet.
//!

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use judge::{Error, ErrorKind, Result, ResultExt};
use sandbox::Context;

use crate::meta::ProblemMeta;
use crate::ports::{LockService, ObjectStorage};

/// TTL of the distributed single-flight lock.
const LOCK_TTL: Duration = Duration::from_secs(300);

/// Interval between warm-path polls while another worker downloads.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Name of the sidecar file recording which meta a directory holds.
const SIDECAR_FILE: &str = "meta.json";

/// Name of the temporary download file inside a pack directory.
const DOWNLOAD_TMP_FILE: &str = "data-pack.tmp";

/// Configuration of the data pack cache.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Directory extracted packs live under, as
    /// `{root}/{problemId}/{version}/`.
    pub root_dir: PathBuf,

    /// Storage bucket the packs are downloaded from.
    pub bucket: String,

    /// Lifetime of an unused cache entry.
    pub ttl: Duration,

    /// How long a contended fetch waits for the lock holder.
    pub lock_wait: Duration,

    /// Maximum number of entries; zero disables the bound.
    pub max_entries: usize,

    /// Maximum total size in bytes; zero disables the bound.
    pub max_bytes: u64,
}

/// A pinned reference to an extracted data pack. The directory is protected
/// from eviction until the handle is dropped.
#[derive(Debug)]
pub struct PackHandle {
    path: PathBuf,
    holders: Arc<AtomicUsize>,
}

impl PackHandle {
    /// Directory containing `manifest.json`, `config.json` and the test
    /// files.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PackHandle {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Entry {
    path: PathBuf,
    size_bytes: u64,
    expires_at: Instant,
    holders: Arc<AtomicUsize>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<(i64, i32), Entry>,

    /// Keys in recency order, most recently used last.
    lru: Vec<(i64, i32)>,
}

impl CacheState {
    fn touch(&mut self, key: (i64, i32)) {
        self.lru.retain(|k| *k != key);
        self.lru.push(key);
    }

    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|entry| entry.size_bytes).sum()
    }
}

/// The process-wide data pack cache.
pub struct DataPackCache {
    options: CacheOptions,
    storage: Arc<dyn ObjectStorage>,
    lock: Arc<dyn LockService>,
    state: Mutex<CacheState>,
}

impl DataPackCache {
    /// Create a cache over the given storage and lock ports.
    pub fn new(
        options: CacheOptions,
        storage: Arc<dyn ObjectStorage>,
        lock: Arc<dyn LockService>) -> Result<Self> {
        if options.root_dir.as_os_str().is_empty() {
            return Err(Error::from(ErrorKind::Cache(
                String::from("cache root directory is not configured"))));
        }
        std::fs::create_dir_all(&options.root_dir)
            .chain_err(|| format!(
                "failed to create cache root {}", options.root_dir.display()))?;

        Ok(DataPackCache {
            options,
            storage,
            lock,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// Get the local directory of the given problem version, downloading and
    /// extracting the pack when no worker has it yet. Concurrent calls for
    /// the same version collapse into one download.
    pub fn get(&self, ctx: &Context, meta: &ProblemMeta) -> Result<PackHandle> {
        meta.validate()?;
        ctx.ensure_active().map_err(Error::from)?;

        let key = (meta.problem_id, meta.version);

        // Fast path: the version is indexed in memory.
        if let Some(handle) = self.memory_hit(key) {
            return Ok(handle);
        }

        // Warm path: a previous process run left a matching directory.
        if let Some(size) = self.warm_size(meta) {
            return Ok(self.index(key, meta, size));
        }

        // Cold path: single-flight under the distributed lock.
        let lock_key = format!(
            "judge:datapack:lock:{}:{}", meta.problem_id, meta.version);
        if self.lock.try_lock(&lock_key, LOCK_TTL)? {
            let _guard = UnlockGuard { lock: &*self.lock, key: &lock_key };

            // Another worker may have finished between our checks and the
            // lock acquisition.
            if let Some(size) = self.warm_size(meta) {
                return Ok(self.index(key, meta, size));
            }

            let size = self.fetch_and_extract(ctx, meta)?;
            Ok(self.index(key, meta, size))
        } else {
            self.await_other_worker(ctx, meta, key)
        }
    }

    fn memory_hit(&self, key: (i64, i32)) -> Option<PackHandle> {
        let mut state = self.state.lock().unwrap();
        let ttl = self.options.ttl;
        let entry = state.entries.get_mut(&key)?;

        entry.expires_at = Instant::now() + ttl;
        entry.holders.fetch_add(1, Ordering::SeqCst);
        let handle = PackHandle {
            path: entry.path.clone(),
            holders: entry.holders.clone(),
        };
        state.touch(key);
        Some(handle)
    }

    /// Check whether the on-disk directory matches the requested meta; on a
    /// match, return its size.
    fn warm_size(&self, meta: &ProblemMeta) -> Option<u64> {
        let dir = self.pack_dir(meta);
        let raw = std::fs::read_to_string(dir.join(SIDECAR_FILE)).ok()?;
        let stored: ProblemMeta = serde_json::from_str(&raw).ok()?;

        let matches = stored.manifest_hash == meta.manifest_hash
            && stored.data_pack_hash == meta.data_pack_hash
            && dir.join(judge::manifest::MANIFEST_FILE).exists();
        if !matches {
            return None;
        }

        Some(dir_size(&dir))
    }

    /// Poll the warm path while another worker holds the download lock.
    fn await_other_worker(&self, ctx: &Context, meta: &ProblemMeta, key: (i64, i32))
        -> Result<PackHandle> {
        let deadline = Instant::now() + self.options.lock_wait;
        loop {
            ctx.ensure_active().map_err(Error::from)?;

            if let Some(handle) = self.memory_hit(key) {
                return Ok(handle);
            }
            if let Some(size) = self.warm_size(meta) {
                return Ok(self.index(key, meta, size));
            }
            if Instant::now() >= deadline {
                return Err(Error::from(ErrorKind::Timeout(format!(
                    "data pack {}:{} still locked by another worker",
                    meta.problem_id, meta.version))));
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Register the directory in the memory index, returning a pinned
    /// handle, and enforce the eviction bounds.
    fn index(&self, key: (i64, i32), meta: &ProblemMeta, size_bytes: u64) -> PackHandle {
        let mut state = self.state.lock().unwrap();

        let path = self.pack_dir(meta);
        let entry = state.entries.entry(key).or_insert_with(|| Entry {
            path: path.clone(),
            size_bytes,
            expires_at: Instant::now(),
            holders: Arc::new(AtomicUsize::new(0)),
        });
        entry.size_bytes = size_bytes;
        entry.expires_at = Instant::now() + self.options.ttl;
        entry.holders.fetch_add(1, Ordering::SeqCst);
        let handle = PackHandle {
            path: entry.path.clone(),
            holders: entry.holders.clone(),
        };
        state.touch(key);

        self.enforce_eviction(&mut state);
        handle
    }

    fn enforce_eviction(&self, state: &mut CacheState) {
        let now = Instant::now();
        let expired: Vec<(i64, i32)> = state.entries.iter()
            .filter(|(_, entry)| {
                entry.expires_at <= now && entry.holders.load(Ordering::SeqCst) == 0
            })
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.evict(state, key);
        }

        loop {
            let over_entries = self.options.max_entries > 0
                && state.entries.len() > self.options.max_entries;
            let over_bytes = self.options.max_bytes > 0
                && state.total_bytes() > self.options.max_bytes;
            if !over_entries && !over_bytes {
                break;
            }

            let victim = state.lru.iter()
                .find(|key| {
                    state.entries.get(key)
                        .map(|entry| entry.holders.load(Ordering::SeqCst) == 0)
                        .unwrap_or(false)
                })
                .copied();
            match victim {
                Some(key) => self.evict(state, key),
                None => {
                    log::warn!("data pack cache over budget but every entry is pinned");
                    break;
                }
            }
        }
    }

    fn evict(&self, state: &mut CacheState, key: (i64, i32)) {
        if let Some(entry) = state.entries.remove(&key) {
            log::info!("evicting data pack {}:{} ({} bytes)",
                key.0, key.1, entry.size_bytes);
            if let Err(e) = std::fs::remove_dir_all(&entry.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove {}: {}", entry.path.display(), e);
                }
            }
            // Drop the now-empty problem directory too, best effort.
            if let Some(parent) = entry.path.parent() {
                let _ = std::fs::remove_dir(parent);
            }
        }
        state.lru.retain(|k| *k != key);
    }

    fn pack_dir(&self, meta: &ProblemMeta) -> PathBuf {
        self.options.root_dir
            .join(meta.problem_id.to_string())
            .join(meta.version.to_string())
    }

    /// Download, verify and extract the pack into its directory. Returns the
    /// extracted size in bytes.
    fn fetch_and_extract(&self, ctx: &Context, meta: &ProblemMeta) -> Result<u64> {
        let dir = self.pack_dir(meta);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .chain_err(|| format!("failed to clear {}", dir.display()))?;
        }
        std::fs::create_dir_all(&dir)
            .chain_err(|| format!("failed to create {}", dir.display()))?;

        let tmp_path = dir.join(DOWNLOAD_TMP_FILE);
        let digest = self.download(ctx, meta, &tmp_path)?;

        if !meta.data_pack_hash.is_empty()
            && !digest.eq_ignore_ascii_case(&meta.data_pack_hash) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(Error::from(ErrorKind::Cache(format!(
                "data pack {}:{} hash mismatch: expected {}, got {}",
                meta.problem_id, meta.version, meta.data_pack_hash, digest))));
        }

        if let Err(e) = extract_pack(&tmp_path, &dir) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }
        std::fs::remove_file(&tmp_path)
            .chain_err(|| format!("failed to remove {}", tmp_path.display()))?;

        let sidecar = serde_json::to_string(meta)?;
        std::fs::write(dir.join(SIDECAR_FILE), sidecar)
            .chain_err(|| format!("failed to write sidecar in {}", dir.display()))?;

        log::info!("cached data pack {}:{} at {}",
            meta.problem_id, meta.version, dir.display());
        Ok(dir_size(&dir))
    }

    /// Stream the pack object into `target` while hashing it. Returns the
    /// hex sha-256 of the downloaded bytes.
    fn download(&self, ctx: &Context, meta: &ProblemMeta, target: &Path) -> Result<String> {
        let mut stream = self.storage
            .get_object(ctx, &self.options.bucket, &meta.data_pack_key)
            .chain_err(|| format!(
                "failed to open data pack {}:{}", meta.problem_id, meta.version))?;

        let mut file = std::fs::File::create(target)
            .chain_err(|| format!("failed to create {}", target.display()))?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            ctx.ensure_active().map_err(Error::from)?;
            let read = stream.read(&mut buffer)
                .map_err(|e| Error::from(ErrorKind::Cache(format!(
                    "data pack download failed: {}", e))))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            file.write_all(&buffer[..read])
                .chain_err(|| format!("failed to write {}", target.display()))?;
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// Releases the distributed lock when the single-flight section ends.
struct UnlockGuard<'a> {
    lock: &'a dyn LockService,
    key: &'a str,
}

impl<'a> Drop for UnlockGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock(self.key) {
            log::warn!("failed to release {}: {}", self.key, e);
        }
    }
}

/// Extract a tar.zstd archive entry by entry, rejecting any entry whose
/// clean path is absolute or escapes the extraction root.
fn extract_pack(archive_path: &Path, dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .chain_err(|| format!("failed to open {}", archive_path.display()))?;
    let decoder = zstd::Decoder::new(file)
        .chain_err(|| "failed to start zstd decoding")?;
    let mut archive = tar::Archive::new(decoder);

    let entries = archive.entries()
        .map_err(|e| Error::from(ErrorKind::Cache(format!(
            "corrupt data pack: {}", e))))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| Error::from(ErrorKind::Cache(format!(
                "corrupt data pack entry: {}", e))))?;

        let entry_path = entry.path()
            .map_err(|e| Error::from(ErrorKind::Cache(format!(
                "unreadable entry path: {}", e))))?
            .into_owned();
        validate_entry_path(&entry_path)?;

        let target = dir.join(&entry_path);
        if !target.starts_with(dir) {
            return Err(escape_error(&entry_path));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .chain_err(|| format!("failed to create {}", parent.display()))?;
        }

        entry.unpack(&target)
            .map_err(|e| Error::from(ErrorKind::Cache(format!(
                "failed to extract {}: {}", entry_path.display(), e))))?;
    }

    Ok(())
}

fn validate_entry_path(path: &Path) -> Result<()> {
    use std::path::Component;

    if path.as_os_str().is_empty() {
        return Err(escape_error(path));
    }
    for component in path.components() {
        match component {
            Component::Normal(..) | Component::CurDir => (),
            _ => return Err(escape_error(path)),
        }
    }

    Ok(())
}

fn escape_error(path: &Path) -> Error {
    Error::from(ErrorKind::Cache(format!(
        "data pack entry escapes the extraction root: {}", path.display())))
}

/// Total size in bytes of every file under the given directory.
fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(..) => return 0,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    struct MemoryStorage {
        objects: HashMap<String, Vec<u8>>,
        downloads: AtomicUsize,
    }

    impl ObjectStorage for MemoryStorage {
        fn get_object(&self, _ctx: &Context, _bucket: &str, key: &str)
            -> Result<Box<dyn Read + Send>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            // A slow network: lets the contending thread really hit the
            // polling path.
            std::thread::sleep(Duration::from_millis(50));
            match self.objects.get(key) {
                Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
                None => Err(Error::from(ErrorKind::Cache(format!(
                    "no such object {}", key)))),
            }
        }
    }

    struct MemoryLock {
        held: Mutex<HashSet<String>>,
    }

    impl LockService for MemoryLock {
        fn try_lock(&self, key: &str, _ttl: Duration) -> Result<bool> {
            Ok(self.held.lock().unwrap().insert(key.to_owned()))
        }

        fn unlock(&self, key: &str) -> Result<()> {
            self.held.lock().unwrap().remove(key);
            Ok(())
        }
    }

    struct RefusingLock;

    impl LockService for RefusingLock {
        fn try_lock(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            Ok(false)
        }

        fn unlock(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn pack_bytes(extra_entry: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let add = |builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        };

        add(&mut builder, "manifest.json",
            br#"{"tests": [{"testId": "t1", "inputPath": "cases/t1.in"}]}"#);
        add(&mut builder, "config.json", br#"{"defaultLimits": {"cpuTimeMs": 1000}}"#);
        add(&mut builder, "cases/t1.in", b"1 2\n");
        if let Some((name, data)) = extra_entry {
            add(&mut builder, name, data);
        }

        let tar_bytes = builder.into_inner().unwrap();
        zstd::encode_all(&tar_bytes[..], 0).unwrap()
    }

    fn meta_for(pack: &[u8], problem_id: i64, version: i32) -> ProblemMeta {
        ProblemMeta {
            problem_id,
            version,
            manifest_hash: String::from("mh-1"),
            data_pack_key: format!("packs/{}-{}.tar.zst", problem_id, version),
            data_pack_hash: hex::encode(Sha256::digest(pack)),
            updated_at: 1_700_000_000,
        }
    }

    fn cache_with(
        root: &Path,
        objects: HashMap<String, Vec<u8>>,
        max_entries: usize) -> (Arc<DataPackCache>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage {
            objects,
            downloads: AtomicUsize::new(0),
        });
        let lock = Arc::new(MemoryLock { held: Mutex::new(HashSet::new()) });
        let cache = DataPackCache::new(CacheOptions {
            root_dir: root.to_path_buf(),
            bucket: String::from("data-packs"),
            ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(5),
            max_entries,
            max_bytes: 0,
        }, storage.clone(), lock).unwrap();

        (Arc::new(cache), storage)
    }

    #[test]
    fn cold_fetch_extracts_and_indexes() {
        let root = tempfile::tempdir().unwrap();
        let pack = pack_bytes(None);
        let meta = meta_for(&pack, 7, 3);
        let mut objects = HashMap::new();
        objects.insert(meta.data_pack_key.clone(), pack);
        let (cache, storage) = cache_with(root.path(), objects, 0);

        let handle = cache.get(&Context::background(), &meta).unwrap();

        assert!(handle.path().ends_with("7/3"));
        assert!(handle.path().join("manifest.json").exists());
        assert!(handle.path().join("cases/t1.in").exists());
        assert!(handle.path().join(SIDECAR_FILE).exists());
        assert!(!handle.path().join(DOWNLOAD_TMP_FILE).exists());
        assert_eq!(1, storage.downloads.load(Ordering::SeqCst));

        // Second get is served from memory.
        let again = cache.get(&Context::background(), &meta).unwrap();
        assert_eq!(handle.path(), again.path());
        assert_eq!(1, storage.downloads.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_gets_download_once() {
        let root = tempfile::tempdir().unwrap();
        let pack = pack_bytes(None);
        let meta = meta_for(&pack, 7, 3);
        let mut objects = HashMap::new();
        objects.insert(meta.data_pack_key.clone(), pack);
        let (cache, storage) = cache_with(root.path(), objects, 0);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = cache.clone();
            let meta = meta.clone();
            handles.push(std::thread::spawn(move || {
                cache.get(&Context::background(), &meta).unwrap().path().to_path_buf()
            }));
        }
        let paths: Vec<PathBuf> = handles.into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(paths[0], paths[1]);
        assert_eq!(1, storage.downloads.load(Ordering::SeqCst));
    }

    #[test]
    fn hash_mismatch_is_a_cache_error() {
        let root = tempfile::tempdir().unwrap();
        let pack = pack_bytes(None);
        let mut meta = meta_for(&pack, 7, 3);
        meta.data_pack_hash = String::from("deadbeef");
        let mut objects = HashMap::new();
        objects.insert(meta.data_pack_key.clone(), pack);
        let (cache, _) = cache_with(root.path(), objects, 0);

        let err = cache.get(&Context::background(), &meta).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Cache(..)));
        assert!(!root.path().join("7/3").join("manifest.json").exists());
    }

    #[test]
    fn escaping_entries_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let pack = pack_bytes(Some(("../evil.txt", b"pwned")));
        let meta = meta_for(&pack, 8, 1);
        let mut objects = HashMap::new();
        objects.insert(meta.data_pack_key.clone(), pack);
        let (cache, _) = cache_with(root.path(), objects, 0);

        let err = cache.get(&Context::background(), &meta).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Cache(..)));
        assert!(!root.path().parent().unwrap().join("evil.txt").exists());
    }

    #[test]
    fn lru_eviction_spares_pinned_entries() {
        let root = tempfile::tempdir().unwrap();
        let pack_a = pack_bytes(None);
        let pack_b = pack_bytes(Some(("cases/t2.in", b"3 4\n")));
        let pack_c = pack_bytes(Some(("cases/t3.in", b"5 6\n")));
        let meta_a = meta_for(&pack_a, 1, 1);
        let meta_b = meta_for(&pack_b, 2, 1);
        let meta_c = meta_for(&pack_c, 3, 1);
        let mut objects = HashMap::new();
        objects.insert(meta_a.data_pack_key.clone(), pack_a);
        objects.insert(meta_b.data_pack_key.clone(), pack_b);
        objects.insert(meta_c.data_pack_key.clone(), pack_c);
        let (cache, _) = cache_with(root.path(), objects, 1);

        let ctx = Context::background();
        let handle_a = cache.get(&ctx, &meta_a).unwrap();
        let path_a = handle_a.path().to_path_buf();

        // A is still pinned: fetching B must not evict it even though the
        // cache is over its entry budget.
        let handle_b = cache.get(&ctx, &meta_b).unwrap();
        let path_b = handle_b.path().to_path_buf();
        assert!(path_a.join("manifest.json").exists());

        // Once released, the next registration evicts the LRU entries.
        drop(handle_a);
        drop(handle_b);
        let handle_c = cache.get(&ctx, &meta_c).unwrap();
        assert!(!path_a.exists());
        assert!(!path_b.exists());
        assert!(handle_c.path().join("manifest.json").exists());
    }

    #[test]
    fn contended_fetch_times_out() {
        let root = tempfile::tempdir().unwrap();
        let pack = pack_bytes(None);
        let meta = meta_for(&pack, 9, 1);
        let storage = Arc::new(MemoryStorage {
            objects: HashMap::new(),
            downloads: AtomicUsize::new(0),
        });
        let cache = DataPackCache::new(CacheOptions {
            root_dir: root.path().to_path_buf(),
            bucket: String::from("data-packs"),
            ttl: Duration::from_secs(60),
            lock_wait: Duration::from_millis(300),
            max_entries: 0,
            max_bytes: 0,
        }, storage.clone(), Arc::new(RefusingLock)).unwrap();

        let err = cache.get(&Context::background(), &meta).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout(..)));
        assert_eq!(0, storage.downloads.load(Ordering::SeqCst));
    }

    #[test]
    fn warm_directory_is_reindexed_without_download() {
        let root = tempfile::tempdir().unwrap();
        let pack = pack_bytes(None);
        let meta = meta_for(&pack, 7, 4);
        let mut objects = HashMap::new();
        objects.insert(meta.data_pack_key.clone(), pack);

        {
            let (cache, storage) = cache_with(root.path(), objects.clone(), 0);
            cache.get(&Context::background(), &meta).unwrap();
            assert_eq!(1, storage.downloads.load(Ordering::SeqCst));
        }

        // A fresh cache instance (fresh memory index) finds the directory on
        // disk and never touches the storage.
        let (cache, storage) = cache_with(root.path(), objects, 0);
        let handle = cache.get(&Context::background(), &meta).unwrap();
        assert!(handle.path().join("manifest.json").exists());
        assert_eq!(0, storage.downloads.load(Ordering::SeqCst));
    }

    #[test]
    fn rejects_invalid_meta() {
        let root = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(root.path(), HashMap::new(), 0);
        let meta = ProblemMeta {
            problem_id: 0,
            version: 1,
            manifest_hash: String::new(),
            data_pack_key: String::from("k"),
            data_pack_hash: String::new(),
            updated_at: 0,
        };
        assert!(cache.get(&Context::background(), &meta).is_err());
    }
}
