//! Top-level fetch/insert orchestration: the state machine that walks a
//! `ContentRef` down through redirects, manifests, archives and splitfiles
//! until it resolves to a Bucket of bytes, plus the mirror insert path.
//!
//! [`LocalBlockStore`] is this crate's stand-in for the peer-to-peer
//! routing/transport layer and on-disk datastore the original system
//! treats as external collaborators (§4.9): a content-addressed directory,
//! the way the teacher's [`crate::index`] keys blocks by `content_hash`.

use crate::archive_manager::ArchiveManager;
use crate::bucket::{read_all, Bucket, BucketFactory, MemBucket};
use crate::context::{ArchiveContext, FetchContext, FetchEvent, InsertContext};
use crate::error::{FetchError, MetadataError};
use crate::fec::FecQueue;
use crate::metadata::{ArchiveKind, ClientMetadata, Metadata, Target};
use crate::splitfile::{BlockFetcher, BlockInserter, DEFAULT_BLOCK_LEN};
use crate::uri::{ContentRef, ContentURI, RoutingKey};
use std::path::PathBuf;
use std::sync::Arc;

/// Content-addressed directory-backed block store. Not part of the
/// original system's scope — it exists so the rest of this crate can be
/// exercised end-to-end without a real network.
pub struct LocalBlockStore {
    dir: PathBuf,
}

impl LocalBlockStore {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &RoutingKey) -> PathBuf {
        self.dir.join(hex::encode(key))
    }
}

impl BlockFetcher for LocalBlockStore {
    fn fetch_block(&self, key: &RoutingKey) -> Result<Arc<dyn Bucket>, FetchError> {
        let bytes = std::fs::read(self.path_for(key))
            .map_err(|_| FetchError::BlockNotFound(hex::encode(key)))?;
        Ok(Arc::new(MemBucket::from_bytes(bytes)))
    }
}

impl BlockInserter for LocalBlockStore {
    fn insert_block(&self, data: &[u8]) -> Result<RoutingKey, FetchError> {
        let key: RoutingKey = *blake3::hash(data).as_bytes();
        let path = self.path_for(&key);
        if !path.exists() {
            std::fs::write(&path, data)?;
        }
        Ok(key)
    }
}

/// Everything needed to walk a fetch: the collaborators that in the real
/// system live behind the network, plus the engines this crate owns.
pub struct FetchEnv<'a> {
    pub store: &'a LocalBlockStore,
    pub archive_manager: &'a Arc<ArchiveManager>,
    pub queue: &'a Arc<FecQueue>,
    pub factory: &'a BucketFactory,
}

pub fn fetch(
    uri: &ContentRef,
    archive_ctx: &ArchiveContext,
    fetch_ctx: &FetchContext,
    env: &FetchEnv,
) -> Result<Arc<dyn Bucket>, FetchError> {
    let result = fetch_inner(uri, None, archive_ctx, fetch_ctx, 0, 0, env);
    match &result {
        Ok(b) => {
            if let Ok(size) = b.size() {
                fetch_ctx.event_sink.on_event(FetchEvent::FetchCompleted { bytes: size });
            }
        }
        // A cancelled fetch was never really "failed" from the caller's
        // point of view — it was stopped on request, so no failure event
        // is dispatched for it.
        Err(FetchError::Cancelled) => {}
        Err(e) => fetch_ctx.event_sink.on_event(FetchEvent::FetchFailed { reason: e.to_string() }),
    }
    result
}

type CurrentArchive = Option<(String, ArchiveKind)>;

fn fetch_inner(
    uri: &ContentRef,
    current_archive: CurrentArchive,
    archive_ctx: &ArchiveContext,
    fetch_ctx: &FetchContext,
    depth: u32,
    archive_level: u32,
    env: &FetchEnv,
) -> Result<Arc<dyn Bucket>, FetchError> {
    if archive_ctx.is_cancelled() {
        return Err(FetchError::Cancelled);
    }
    let key = match &uri.key {
        ContentURI::Chk { hash, .. } => *hash,
        _ => return Err(FetchError::Internal(
            "only CHK keys are resolvable without the real peer-to-peer routing layer".into(),
        )),
    };
    let raw = env.store.fetch_block(&key)?;
    let bytes = read_all(raw.as_ref())?;
    interpret(&bytes, raw, uri, current_archive, archive_ctx, fetch_ctx, depth, archive_level, env)
}

/// Try the bytes as a metadata blob; fall back to raw data on a bad-magic
/// parse failure, mirroring how the original system tells a document from
/// plain content.
fn interpret(
    bytes: &[u8],
    bucket: Arc<dyn Bucket>,
    uri: &ContentRef,
    current_archive: CurrentArchive,
    archive_ctx: &ArchiveContext,
    fetch_ctx: &FetchContext,
    depth: u32,
    archive_level: u32,
    env: &FetchEnv,
) -> Result<Arc<dyn Bucket>, FetchError> {
    let blob_len = bytes.len() as u64;
    if blob_len > fetch_ctx.max_metadata_size {
        return Err(FetchError::TooBig { got: blob_len, cap: fetch_ctx.max_metadata_size });
    }
    match crate::metadata::parse(bytes) {
        Ok(meta) => {
            fetch_metadata(meta, uri, current_archive, archive_ctx, fetch_ctx, depth, archive_level, env)
        }
        Err(MetadataError::BadMagic { .. }) => {
            if !fetch_ctx.ignore_too_many_path_components && !uri.meta_strings.is_empty() {
                return Err(FetchError::TooManyPathComponents);
            }
            let size = bucket.size()?;
            if size > fetch_ctx.max_output_len {
                return Err(FetchError::TooBig { got: size, cap: fetch_ctx.max_output_len });
            }
            Ok(bucket)
        }
        Err(e) => Err(FetchError::Metadata(e)),
    }
}

fn fetch_metadata(
    meta: Metadata,
    uri: &ContentRef,
    current_archive: CurrentArchive,
    archive_ctx: &ArchiveContext,
    fetch_ctx: &FetchContext,
    depth: u32,
    archive_level: u32,
    env: &FetchEnv,
) -> Result<Arc<dyn Bucket>, FetchError> {
    if archive_ctx.is_cancelled() {
        return Err(FetchError::Cancelled);
    }
    fetch_ctx.event_sink.on_event(FetchEvent::MetadataParsed);

    match meta {
        Metadata::SimpleRedirect { target, client } => {
            check_mime(&client, fetch_ctx)?;
            let next_depth = depth + 1;
            if next_depth > fetch_ctx.max_recursion_level {
                return Err(FetchError::RecursionTooDeep { depth: next_depth, max: fetch_ctx.max_recursion_level });
            }
            resolve_target(&target, current_archive, uri, archive_ctx, fetch_ctx, next_depth, archive_level, env)
        }
        Metadata::MultiLevelMetadata { target, .. } => {
            let inner = resolve_target(&target, current_archive.clone(), uri, archive_ctx, fetch_ctx, depth, archive_level, env)?;
            let inner_bytes = read_all(inner.as_ref())?;
            interpret(&inner_bytes, inner, uri, current_archive, archive_ctx, fetch_ctx, depth, archive_level, env)
        }
        Metadata::SimpleManifest { entries } => {
            let (name, rest) = match uri.pop_front() {
                Some(pair) => pair,
                None => (String::new(), uri.clone()),
            };
            let sub = entries.into_iter().find(|(n, _)| *n == name).map(|(_, m)| m)
                .ok_or(FetchError::NotEnoughMetaStrings(name))?;
            fetch_metadata(sub, &rest, current_archive, archive_ctx, fetch_ctx, depth, archive_level, env)
        }
        Metadata::ArchiveManifest { target, archive_type, client } => {
            check_mime(&client, fetch_ctx)?;
            if fetch_ctx.return_archive_manifests_as_data {
                let meta = Metadata::ArchiveManifest { target, archive_type, client };
                let blob = crate::metadata::emit(&meta)
                    .map_err(|u| FetchError::Internal(format!("{} unresolved metadata sub-entries", u.0.len())))?;
                let b = env.factory.make(blob.len() as u64)?;
                crate::bucket::write_all(b.as_ref(), &blob)?;
                return Ok(b);
            }

            let new_level = archive_level + 1;
            if new_level > archive_ctx.max_archive_levels {
                return Err(FetchError::Internal("max_archive_levels exceeded".into()));
            }

            let archive_bucket = resolve_target(&target, current_archive, uri, archive_ctx, fetch_ctx, depth, archive_level, env)?;
            let archive_key = uri.to_string();

            if fetch_ctx.dont_enter_implicit_archives {
                return Ok(archive_bucket);
            }

            let (next_name, rest) = uri.pop_front().unwrap_or((String::new(), uri.clone()));
            let entry_bucket = archive_get_with_restart(
                env, &archive_key, archive_type, &next_name, archive_ctx,
                || Ok(archive_bucket.clone()),
            )?;
            let entry_bytes = read_all(entry_bucket.as_ref())?;
            interpret(&entry_bytes, entry_bucket, &rest, Some((archive_key, archive_type)), archive_ctx, fetch_ctx, depth, new_level, env)
        }
        Metadata::ArchiveInternalRedirect { name_in_archive, client } => {
            check_mime(&client, fetch_ctx)?;
            let (archive_key, archive_type) = current_archive.clone()
                .ok_or_else(|| FetchError::Internal("archive-internal redirect outside any archive context".into()))?;
            let bucket = archive_get_with_restart(
                env, &archive_key, archive_type, &name_in_archive, archive_ctx,
                || Err(crate::error::ArchiveError::Failure("archive container is no longer reachable from this node".into())),
            )?;
            let bytes = read_all(bucket.as_ref())?;
            interpret(&bytes, bucket, uri, current_archive, archive_ctx, fetch_ctx, depth, archive_level, env)
        }
    }
}

/// Retries an [`ArchiveManager::get`] lookup against `archive_ctx`'s restart
/// budget whenever the archive container turns out to be an incomplete
/// prefix ([`crate::error::ArchiveError::Restart`]), per spec: the caller
/// owns the retry budget, not the archive manager itself.
fn archive_get_with_restart(
    env: &FetchEnv,
    archive_key: &str,
    archive_type: ArchiveKind,
    internal_name: &str,
    archive_ctx: &ArchiveContext,
    fetch_archive_bucket: impl Fn() -> Result<Arc<dyn Bucket>, crate::error::ArchiveError>,
) -> Result<Arc<dyn Bucket>, FetchError> {
    loop {
        let result = env.archive_manager.get(
            archive_key, archive_type, internal_name, archive_ctx, false, env.factory,
            &fetch_archive_bucket,
        );
        match result {
            Ok(b) => return Ok(b),
            Err(crate::error::ArchiveError::Restart) if archive_ctx.take_restart() => {
                archive_ctx.forget_visit(archive_key);
                continue;
            }
            Err(e) => return Err(FetchError::Archive(e)),
        }
    }
}

fn resolve_target(
    target: &Target,
    current_archive: CurrentArchive,
    uri: &ContentRef,
    archive_ctx: &ArchiveContext,
    fetch_ctx: &FetchContext,
    depth: u32,
    archive_level: u32,
    env: &FetchEnv,
) -> Result<Arc<dyn Bucket>, FetchError> {
    match target {
        Target::Uri(r) => fetch_inner(r, current_archive, archive_ctx, fetch_ctx, depth, archive_level, env),
        Target::Splitfile(sf) => {
            // A splitfile is always a terminal document: any leftover
            // meta-strings in the URI can never be resolved further.
            if !fetch_ctx.ignore_too_many_path_components && !uri.meta_strings.is_empty() {
                return Err(FetchError::TooManyPathComponents);
            }
            let block_ctx = fetch_ctx.splitfile_default_block_mask();
            crate::splitfile::fetch_splitfile(sf, env.store, env.factory, env.queue, &block_ctx)
        }
    }
}

fn check_mime(client: &ClientMetadata, ctx: &FetchContext) -> Result<(), FetchError> {
    if let Some(mime) = &client.mime {
        if !ctx.mime_allowed(mime) {
            return Err(FetchError::UnsafeContentType(mime.clone()));
        }
    }
    Ok(())
}

/// Insert `data` as a document: a raw CHK block if small enough to fit
/// inline, a splitfile-backed `SimpleRedirect` otherwise, recursively
/// wrapped in a `MultiLevelMetadata` if even the resulting metadata blob
/// would be oversized.
pub fn insert(
    data: &[u8],
    fetch_ctx: &FetchContext,
    insert_ctx: &InsertContext,
    env: &FetchEnv,
) -> Result<ContentRef, FetchError> {
    let target = if (data.len() as u64) <= DEFAULT_BLOCK_LEN as u64 {
        let key = env.store.insert_block(data)?;
        Target::Uri(raw_chk(key))
    } else {
        let sf = crate::splitfile::insert_splitfile(data, env.store, env.factory, env.queue, fetch_ctx, insert_ctx)?;
        Target::Splitfile(sf)
    };

    let meta = Metadata::SimpleRedirect { target, client: ClientMetadata { mime: None, mime_params: None } };
    let blob = crate::metadata::emit(&meta)
        .map_err(|u| FetchError::Internal(format!("{} unresolved metadata sub-entries", u.0.len())))?;

    if (blob.len() as u64) <= fetch_ctx.max_metadata_size {
        let key = env.store.insert_block(&blob)?;
        return Ok(ContentRef::new(raw_chk(key).key));
    }

    let inner_sf = crate::splitfile::insert_splitfile(&blob, env.store, env.factory, env.queue, fetch_ctx, insert_ctx)?;
    let outer = Metadata::MultiLevelMetadata { target: Target::Splitfile(inner_sf), client: ClientMetadata { mime: None, mime_params: None } };
    let outer_blob = crate::metadata::emit(&outer)
        .map_err(|u| FetchError::Internal(format!("{} unresolved metadata sub-entries", u.0.len())))?;
    let key = env.store.insert_block(&outer_blob)?;
    Ok(ContentRef::new(raw_chk(key).key))
}

fn raw_chk(hash: RoutingKey) -> ContentRef {
    ContentRef::new(ContentURI::Chk { hash, crypto_params: Vec::new(), extras: Vec::new() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::FecQueue;

    fn test_env(dir: &std::path::Path) -> (LocalBlockStore, Arc<ArchiveManager>, Arc<FecQueue>, BucketFactory) {
        let store = LocalBlockStore::new(dir.join("store")).unwrap();
        let manager = Arc::new(ArchiveManager::new(16 * 1024 * 1024, 16 * 1024 * 1024, dir.join("tags")));
        let queue = FecQueue::new(2, 16);
        let factory = BucketFactory::new(dir.join("buckets"));
        (store, manager, queue, factory)
    }

    #[test]
    fn insert_then_fetch_small_block() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager, queue, factory) = test_env(dir.path());
        let env = FetchEnv { store: &store, archive_manager: &manager, queue: &queue, factory: &factory };
        let fetch_ctx = FetchContext::default();
        let insert_ctx = InsertContext::default();

        let uri = insert(b"hello, content layer", &fetch_ctx, &insert_ctx, &env).unwrap();
        let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
        let bucket = fetch(&uri, &archive_ctx, &fetch_ctx, &env).unwrap();
        assert_eq!(read_all(bucket.as_ref()).unwrap(), b"hello, content layer");
    }

    #[test]
    fn insert_then_fetch_large_splitfile_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager, queue, factory) = test_env(dir.path());
        let env = FetchEnv { store: &store, archive_manager: &manager, queue: &queue, factory: &factory };
        let fetch_ctx = FetchContext::default();
        let insert_ctx = InsertContext { compression_level: 0, ..InsertContext::default() };

        let payload: Vec<u8> = (0..(DEFAULT_BLOCK_LEN * 6)).map(|i| (i % 251) as u8).collect();
        let uri = insert(&payload, &fetch_ctx, &insert_ctx, &env).unwrap();
        let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
        let bucket = fetch(&uri, &archive_ctx, &fetch_ctx, &env).unwrap();
        assert_eq!(read_all(bucket.as_ref()).unwrap(), payload);
    }

    #[test]
    fn simple_manifest_resolves_named_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager, queue, factory) = test_env(dir.path());
        let env = FetchEnv { store: &store, archive_manager: &manager, queue: &queue, factory: &factory };
        let fetch_ctx = FetchContext::default();

        let page_key = store.insert_block(b"<html>hi</html>").unwrap();
        let page_meta = Metadata::SimpleRedirect {
            target: Target::Uri(raw_chk(page_key)),
            client: ClientMetadata { mime: Some("text/html".into()), mime_params: None },
        };
        let manifest = Metadata::SimpleManifest { entries: vec![("index.html".into(), page_meta)] };
        let manifest_blob = crate::metadata::emit(&manifest).unwrap();
        let manifest_key = store.insert_block(&manifest_blob).unwrap();

        let uri = ContentRef::with_path(
            ContentURI::Chk { hash: manifest_key, crypto_params: Vec::new(), extras: Vec::new() },
            vec!["index.html".into()],
        );
        let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
        let bucket = fetch(&uri, &archive_ctx, &fetch_ctx, &env).unwrap();
        assert_eq!(read_all(bucket.as_ref()).unwrap(), b"<html>hi</html>");
    }

    #[test]
    fn cancelled_fetch_returns_cancelled_without_failure_event() {
        struct RecordingSink {
            events: std::sync::Mutex<Vec<FetchEvent>>,
        }
        impl crate::context::EventSink for RecordingSink {
            fn on_event(&self, event: FetchEvent) {
                self.events.lock().unwrap().push(event);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (store, manager, queue, factory) = test_env(dir.path());
        let env = FetchEnv { store: &store, archive_manager: &manager, queue: &queue, factory: &factory };
        let sink = Arc::new(RecordingSink { events: std::sync::Mutex::new(Vec::new()) });
        let fetch_ctx = FetchContext { event_sink: sink.clone(), ..FetchContext::default() };
        let insert_ctx = InsertContext::default();

        let uri = insert(b"hello, content layer", &fetch_ctx, &insert_ctx, &env).unwrap();
        let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
        archive_ctx.cancel();

        let result = fetch(&uri, &archive_ctx, &fetch_ctx, &env);
        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert!(sink.events.lock().unwrap().iter().all(|e| !matches!(e, FetchEvent::FetchFailed { .. })));
    }

    #[test]
    fn leftover_path_components_on_raw_data_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager, queue, factory) = test_env(dir.path());
        let env = FetchEnv { store: &store, archive_manager: &manager, queue: &queue, factory: &factory };
        let fetch_ctx = FetchContext::default();

        let key = store.insert_block(b"plain bytes, not metadata").unwrap();
        let uri = ContentRef::with_path(
            ContentURI::Chk { hash: key, crypto_params: Vec::new(), extras: Vec::new() },
            vec!["no-such-path".into()],
        );
        let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
        let result = fetch(&uri, &archive_ctx, &fetch_ctx, &env);
        assert!(matches!(result, Err(FetchError::TooManyPathComponents)));

        let lenient_ctx = FetchContext { ignore_too_many_path_components: true, ..FetchContext::default() };
        let bucket = fetch(&uri, &archive_ctx, &lenient_ctx, &env).unwrap();
        assert_eq!(read_all(bucket.as_ref()).unwrap(), b"plain bytes, not metadata");
    }

    #[test]
    fn oversized_metadata_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager, queue, factory) = test_env(dir.path());
        let env = FetchEnv { store: &store, archive_manager: &manager, queue: &queue, factory: &factory };
        let fetch_ctx = FetchContext::default();
        let insert_ctx = InsertContext::default();

        let uri = insert(b"hello, content layer", &fetch_ctx, &insert_ctx, &env).unwrap();
        let tiny_ctx = FetchContext { max_metadata_size: 4, ..FetchContext::default() };
        let archive_ctx = ArchiveContext::new(tiny_ctx.max_archive_levels, tiny_ctx.max_archive_restarts);
        let result = fetch(&uri, &archive_ctx, &tiny_ctx, &env);
        assert!(matches!(result, Err(FetchError::TooBig { cap: 4, .. })));
    }

    #[test]
    fn archive_restart_retries_then_succeeds() {
        use crate::bucket::MemBucket;
        use std::sync::atomic::{AtomicUsize, Ordering};

        fn make_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
            let mut out = Vec::new();
            {
                let cursor = std::io::Cursor::new(&mut out);
                let mut zip = zip::ZipWriter::new(cursor);
                let options = zip::write::FileOptions::default();
                for (name, data) in files {
                    zip.start_file(*name, options).unwrap();
                    std::io::Write::write_all(&mut zip, data).unwrap();
                }
                zip.finish().unwrap();
            }
            out
        }

        let dir = tempfile::tempdir().unwrap();
        let (_store, manager, _queue, factory) = test_env(dir.path());
        let archive_ctx = ArchiveContext::new(4, 2);

        let full_zip = make_zip(&[("a.txt", b"hello")]);
        let truncated: Arc<dyn Bucket> = Arc::new(MemBucket::from_bytes(full_zip[..full_zip.len() / 2].to_vec()));
        let complete: Arc<dyn Bucket> = Arc::new(MemBucket::from_bytes(full_zip));

        let attempts = AtomicUsize::new(0);
        let env = FetchEnv { store: &_store, archive_manager: &manager, queue: &_queue, factory: &factory };
        let result = archive_get_with_restart(
            &env,
            "archive-retry",
            ArchiveKind::Zip,
            "a.txt",
            &archive_ctx,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Ok(if n == 0 { truncated.clone() } else { complete.clone() })
            },
        );

        let bucket = result.unwrap();
        assert_eq!(read_all(bucket.as_ref()).unwrap(), b"hello");
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "expected exactly one retry after the restart");
    }
}
