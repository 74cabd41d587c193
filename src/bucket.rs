//! Opaque byte-store handles.
//!
//! [`Bucket`] generalizes the teacher's [`crate::perf::WriteBuffer`] pattern
//! (buffer small writes, flush to the backing store in large chunks) into a
//! trait with two concrete backings: in-memory for small blocks and
//! metadata, temp-file for splitfile segments and archive cache entries.
//! All access is stream-based; nothing here supports seeking.

use crate::error::BucketError;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

/// Byte-store handle. `size_hint` at construction time picks the backing;
/// callers never need to know which one they got.
pub trait Bucket: Send + Sync {
    fn size(&self) -> io::Result<u64>;
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;
    fn writer(&self) -> io::Result<Box<dyn Write + Send>>;
    fn free(&self) -> Result<(), BucketError>;
}

/// In-memory bucket. Used for small blocks, metadata, and FEC shard buffers.
#[derive(Clone)]
pub struct MemBucket {
    data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemBucket {
    pub fn new() -> Self {
        Self { data: Arc::new(Mutex::new(Some(Vec::new()))) }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { data: Arc::new(Mutex::new(Some(bytes))) }
    }

    pub fn read_all(&self) -> Result<Vec<u8>, BucketError> {
        let guard = self.data.lock().unwrap();
        guard.clone().ok_or(BucketError::Freed)
    }
}

impl Default for MemBucket {
    fn default() -> Self { Self::new() }
}

impl Bucket for MemBucket {
    fn size(&self) -> io::Result<u64> {
        let guard = self.data.lock().unwrap();
        Ok(guard.as_ref().map(|d| d.len() as u64).unwrap_or(0))
    }

    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        let guard = self.data.lock().unwrap();
        let bytes = guard.clone().ok_or_else(|| io::Error::other("bucket freed"))?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(MemBucketWriter { bucket: self.clone() }))
    }

    fn free(&self) -> Result<(), BucketError> {
        let mut guard = self.data.lock().unwrap();
        *guard = None;
        Ok(())
    }
}

struct MemBucketWriter {
    bucket: MemBucket,
}

impl Write for MemBucketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.bucket.data.lock().unwrap();
        let data = guard.as_mut().ok_or_else(|| io::Error::other("bucket freed"))?;
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

/// Temp-file-backed bucket, for payloads too large to hold comfortably in
/// memory: splitfile segment assembly and archive cache entries.
pub struct FileBucket {
    path: std::path::PathBuf,
    freed: Mutex<bool>,
}

impl FileBucket {
    pub fn create(dir: &std::path::Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("bucket-{:016x}.tmp", fresh_bucket_id()));
        File::create(&path)?;
        Ok(Self { path, freed: Mutex::new(false) })
    }

    fn check_live(&self) -> io::Result<()> {
        if *self.freed.lock().unwrap() {
            return Err(io::Error::other("bucket freed"));
        }
        Ok(())
    }
}

static NEXT_BUCKET_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
fn fresh_bucket_id() -> u64 {
    NEXT_BUCKET_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

impl Bucket for FileBucket {
    fn size(&self) -> io::Result<u64> {
        self.check_live()?;
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        self.check_live()?;
        Ok(Box::new(File::open(&self.path)?))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        self.check_live()?;
        let mut f = File::options().write(true).open(&self.path)?;
        f.seek(SeekFrom::End(0))?;
        Ok(Box::new(f))
    }

    fn free(&self) -> Result<(), BucketError> {
        let mut guard = self.freed.lock().unwrap();
        if !*guard {
            let _ = std::fs::remove_file(&self.path);
            *guard = true;
        }
        Ok(())
    }
}

impl Drop for FileBucket {
    fn drop(&mut self) {
        let _ = self.free();
    }
}

/// Picks a bucket backing by size hint, the way the teacher's writer picks
/// a flush threshold for [`crate::perf::WriteBuffer`].
pub struct BucketFactory {
    pub memory_threshold: u64,
    pub temp_dir: std::path::PathBuf,
}

impl BucketFactory {
    pub fn new(temp_dir: std::path::PathBuf) -> Self {
        Self { memory_threshold: 256 * 1024, temp_dir }
    }

    pub fn make(&self, size_hint: u64) -> io::Result<Arc<dyn Bucket>> {
        if size_hint <= self.memory_threshold {
            Ok(Arc::new(MemBucket::new()))
        } else {
            Ok(Arc::new(FileBucket::create(&self.temp_dir)?))
        }
    }
}

pub fn write_all(bucket: &dyn Bucket, data: &[u8]) -> io::Result<()> {
    let mut w = bucket.writer()?;
    w.write_all(data)
}

pub fn read_all(bucket: &dyn Bucket) -> io::Result<Vec<u8>> {
    let mut r = bucket.reader()?;
    let mut out = Vec::new();
    r.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_bucket_roundtrip() {
        let b = MemBucket::new();
        write_all(&b, b"hello world").unwrap();
        assert_eq!(read_all(&b).unwrap(), b"hello world");
        assert_eq!(b.size().unwrap(), 11);
    }

    #[test]
    fn file_bucket_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let b = FileBucket::create(dir.path()).unwrap();
        write_all(&b, b"spill to disk").unwrap();
        assert_eq!(read_all(&b).unwrap(), b"spill to disk");
    }

    #[test]
    fn factory_picks_backing_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BucketFactory::new(dir.path().to_path_buf());
        let small = factory.make(10).unwrap();
        write_all(&*small, b"tiny").unwrap();
        assert_eq!(read_all(&*small).unwrap(), b"tiny");
    }

    #[test]
    fn free_invalidates_bucket() {
        let b = MemBucket::new();
        write_all(&b, b"data").unwrap();
        b.free().unwrap();
        assert!(b.reader().is_err());
    }
}
