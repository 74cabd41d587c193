//! On-demand archive extraction into a content-addressed cache.
//!
//! Generalizes the teacher's [`crate::archive::Archive`] read path (open,
//! list, read_file) from a single bespoke container format to the zip/tar
//! family, and borrows the monitor shape from [`crate::fec::queue`] for the
//! "at-most-one extraction per key" latch and LRU eviction at the
//! archive-entry level.

use crate::bucket::{write_all, Bucket, BucketFactory};
use crate::context::ArchiveContext;
use crate::error::ArchiveError;
use crate::metadata::ArchiveKind;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

struct CacheEntry {
    entries: HashMap<String, Arc<dyn Bucket>>,
    total_size: u64,
}

struct ManagerState {
    cache: HashMap<String, CacheEntry>,
    lru: VecDeque<String>,
    in_progress: HashSet<String>,
    total_bytes: u64,
}

pub struct ArchiveManager {
    state: Mutex<ManagerState>,
    cond: Condvar,
    max_cache_bytes: u64,
    max_archive_size: u64,
    tags_dir: std::path::PathBuf,
    next_tag_id: AtomicU64,
}

impl ArchiveManager {
    pub fn new(max_cache_bytes: u64, max_archive_size: u64, tags_dir: std::path::PathBuf) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                cache: HashMap::new(),
                lru: VecDeque::new(),
                in_progress: HashSet::new(),
                total_bytes: 0,
            }),
            cond: Condvar::new(),
            max_cache_bytes,
            max_archive_size,
            tags_dir,
            next_tag_id: AtomicU64::new(0),
        }
    }

    fn touch_lru(lru: &mut VecDeque<String>, key: &str) {
        lru.retain(|k| k != key);
        lru.push_back(key.to_string());
    }

    /// Fetch (extracting on demand if not cached) `internal_name` from the
    /// archive identified by `key`. `fetch_archive_bucket` is only called on
    /// a cache miss.
    pub fn get(
        &self,
        key: &str,
        kind: ArchiveKind,
        internal_name: &str,
        archive_ctx: &ArchiveContext,
        force_refetch: bool,
        factory: &BucketFactory,
        fetch_archive_bucket: impl FnOnce() -> Result<Arc<dyn Bucket>, ArchiveError>,
    ) -> Result<Arc<dyn Bucket>, ArchiveError> {
        loop {
            let mut state = self.state.lock();
            if force_refetch {
                if let Some(entry) = state.cache.remove(key) {
                    state.total_bytes -= entry.total_size;
                    state.lru.retain(|k| k != key);
                }
            } else if let Some(entry) = state.cache.get(key) {
                let found = entry.entries.get(internal_name).cloned();
                Self::touch_lru(&mut state.lru, key);
                return found.ok_or_else(|| ArchiveError::NotInArchive(internal_name.to_string()));
            }

            // Only a genuine extraction (cache miss) needs loop protection;
            // repeat lookups of other entries in an already-cached archive
            // are normal and must not trip it.
            archive_ctx.detect_loop(key).map_err(ArchiveError::Loop)?;

            if state.in_progress.contains(key) {
                self.cond.wait(&mut state);
                continue;
            }
            state.in_progress.insert(key.to_string());
            break;
        }

        let result = (|| {
            let archive_bucket = fetch_archive_bucket()?;
            self.extract_to_cache(key, kind, &archive_bucket, factory)
        })();

        {
            let mut state = self.state.lock();
            state.in_progress.remove(key);
            if let Ok(entries) = &result {
                let total_size: u64 = entries.values().filter_map(|b| b.size().ok()).sum();
                self.admit(&mut state, key, entries.clone(), total_size);
            }
        }
        self.cond.notify_all();

        let entries = result?;
        entries.get(internal_name).cloned()
            .ok_or_else(|| ArchiveError::NotInArchive(internal_name.to_string()))
    }

    fn admit(&self, state: &mut ManagerState, key: &str, entries: HashMap<String, Arc<dyn Bucket>>, total_size: u64) {
        state.cache.insert(key.to_string(), CacheEntry { entries, total_size });
        state.total_bytes += total_size;
        Self::touch_lru(&mut state.lru, key);

        while state.total_bytes > self.max_cache_bytes {
            let Some(victim) = state.lru.pop_front() else { break };
            if victim == key && state.lru.is_empty() {
                // Don't evict the entry we just admitted if it's the only one.
                state.lru.push_back(victim);
                break;
            }
            if let Some(removed) = state.cache.remove(&victim) {
                state.total_bytes -= removed.total_size;
                info!(archive = %victim, "evicted archive from cache");
            }
        }
    }

    /// Parse the archive container with a single forward-sequential scan,
    /// admitting entries until `max_archive_size` is exceeded.
    fn extract_to_cache(
        &self,
        key: &str,
        kind: ArchiveKind,
        archive_bucket: &Arc<dyn Bucket>,
        factory: &BucketFactory,
    ) -> Result<HashMap<String, Arc<dyn Bucket>>, ArchiveError> {
        let entries = match kind {
            ArchiveKind::Zip => extract_zip(archive_bucket, self.max_archive_size, factory)?,
            ArchiveKind::TarGzip => extract_tar_gz(archive_bucket, self.max_archive_size, factory)?,
        };
        info!(archive = %key, entry_count = entries.len(), "extracted archive");
        Ok(entries)
    }

    /// Durable-tagged off-thread extraction: writes a marker file before
    /// starting so a crashed extraction is retried on restart, runs the
    /// extraction on a new thread, then invokes `callback` and removes the
    /// marker.
    pub fn extract_persistent_off_thread(
        self: &Arc<Self>,
        key: String,
        kind: ArchiveKind,
        archive_bucket: Arc<dyn Bucket>,
        internal_name: String,
        factory: BucketFactory,
        callback: Box<dyn FnOnce(Result<Arc<dyn Bucket>, ArchiveError>) + Send>,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.tags_dir)?;
        let tag_id = self.next_tag_id.fetch_add(1, Ordering::Relaxed);
        let tag_path = self.tags_dir.join(format!("extract-{tag_id:016x}.tag"));
        std::fs::write(&tag_path, key.as_bytes())?;

        let manager = self.clone();
        std::thread::spawn(move || {
            let extracted = manager.extract_to_cache(&key, kind, &archive_bucket, &factory);
            let result = match extracted {
                Ok(entries) => {
                    let wanted = entries.get(&internal_name).cloned()
                        .ok_or_else(|| ArchiveError::NotInArchive(internal_name.clone()));
                    let total_size: u64 = entries.values().filter_map(|b| b.size().ok()).sum();
                    let mut state = manager.state.lock();
                    manager.admit(&mut state, &key, entries, total_size);
                    drop(state);
                    wanted
                }
                Err(e) => Err(e),
            };
            if let Err(e) = std::fs::remove_file(&tag_path) {
                warn!(error = %e, "failed to remove extraction tag");
            }
            callback(result);
        });
        Ok(())
    }
}

/// An archive bucket whose bytes haven't fully propagated yet looks
/// identical, at this layer, to a malformed one: the zip end-of-central-
/// directory record is missing, or a stream cuts off mid-entry. Rather than
/// fail such a fetch hard, treat it as [`ArchiveError::Restart`] so the
/// caller can retry — per spec, the caller owns the retry budget.
fn incomplete_io(e: std::io::Error) -> ArchiveError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ArchiveError::Restart
    } else {
        ArchiveError::Io(e)
    }
}

fn zip_open_error(e: zip::result::ZipError) -> ArchiveError {
    match e {
        zip::result::ZipError::InvalidArchive(_) => ArchiveError::Restart,
        zip::result::ZipError::Io(io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => ArchiveError::Restart,
        other => ArchiveError::Zip(other),
    }
}

fn extract_zip(
    bucket: &Arc<dyn Bucket>,
    max_size: u64,
    factory: &BucketFactory,
) -> Result<HashMap<String, Arc<dyn Bucket>>, ArchiveError> {
    let mut raw = Vec::new();
    bucket.reader()?.read_to_end(&mut raw).map_err(incomplete_io)?;
    let cursor = std::io::Cursor::new(raw);
    let mut zip = zip::ZipArchive::new(cursor).map_err(zip_open_error)?;

    let mut out = HashMap::new();
    let mut total = 0u64;
    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(zip_open_error)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        if total + file.size() > max_size {
            break;
        }
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data).map_err(incomplete_io)?;
        total += data.len() as u64;
        let b = factory.make(data.len() as u64)?;
        write_all(b.as_ref(), &data)?;
        out.insert(name, b);
    }
    Ok(out)
}

fn extract_tar_gz(
    bucket: &Arc<dyn Bucket>,
    max_size: u64,
    factory: &BucketFactory,
) -> Result<HashMap<String, Arc<dyn Bucket>>, ArchiveError> {
    let reader = bucket.reader()?;
    let gz = flate2::read::GzDecoder::new(reader);
    let mut archive = tar::Archive::new(gz);

    let mut out = HashMap::new();
    let mut total = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry.map_err(incomplete_io)?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        if total + entry.size() > max_size {
            break;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(incomplete_io)?;
        total += data.len() as u64;
        let b = factory.make(data.len() as u64)?;
        write_all(b.as_ref(), &data)?;
        out.insert(path, b);
    }
    Ok(out)
}
