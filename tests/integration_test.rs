use freetide::bucket::{read_all, BucketFactory};
use freetide::metadata::{emit, parse, ArchiveKind, ClientMetadata, Metadata, Target};
use freetide::{
    fetch, insert, ArchiveContext, ArchiveManager, BlockInserter, ContentRef, ContentURI, FecQueue,
    FetchContext, FetchEnv, InsertContext, LocalBlockStore,
};
use std::sync::Arc;

fn test_env(dir: &std::path::Path) -> (LocalBlockStore, Arc<ArchiveManager>, Arc<FecQueue>, BucketFactory) {
    let store = LocalBlockStore::new(dir.join("store")).unwrap();
    let manager = Arc::new(ArchiveManager::new(8 * 1024 * 1024, 8 * 1024 * 1024, dir.join("tags")));
    let queue = FecQueue::new(2, 16);
    let factory = BucketFactory::new(dir.join("buckets"));
    (store, manager, queue, factory)
}

#[test]
fn insert_then_fetch_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (store, manager, queue, factory) = test_env(dir.path());
    let env = FetchEnv { store: &store, archive_manager: &manager, queue: &queue, factory: &factory };
    let fetch_ctx = FetchContext::default();
    let insert_ctx = InsertContext::default();

    let payload = b"round trip through the content layer".repeat(1000);
    let uri = insert(&payload, &fetch_ctx, &insert_ctx, &env).unwrap();

    let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
    let bucket = fetch(&uri, &archive_ctx, &fetch_ctx, &env).unwrap();
    assert_eq!(read_all(bucket.as_ref()).unwrap(), payload);
}

#[test]
fn archive_manifest_path_resolves_implicit_default_document() {
    let dir = tempfile::tempdir().unwrap();
    let (store, manager, queue, factory) = test_env(dir.path());
    let env = FetchEnv { store: &store, archive_manager: &manager, queue: &queue, factory: &factory };
    let fetch_ctx = FetchContext::default();

    // Build a zip with a default document and insert it raw (no compression:
    // zip is already compressed).
    let mut zip_bytes = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut zip_bytes);
        let mut zip = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::default();
        zip.start_file("", options).unwrap();
        std::io::Write::write_all(&mut zip, b"<html>welcome</html>").unwrap();
        zip.start_file("about.html", options).unwrap();
        std::io::Write::write_all(&mut zip, b"<html>about</html>").unwrap();
        zip.finish().unwrap();
    }
    let container_key = store.insert_block(&zip_bytes).unwrap();
    let container_ref = ContentRef::new(ContentURI::Chk { hash: container_key, crypto_params: Vec::new(), extras: Vec::new() });

    let manifest_meta = Metadata::ArchiveManifest {
        target: Target::Uri(container_ref),
        archive_type: ArchiveKind::Zip,
        client: ClientMetadata { mime: None, mime_params: None },
    };
    let manifest_blob = emit(&manifest_meta).unwrap();
    assert!(parse(&manifest_blob).is_ok());
    let manifest_key = store.insert_block(&manifest_blob).unwrap();
    let manifest_ref = ContentRef::new(ContentURI::Chk { hash: manifest_key, crypto_params: Vec::new(), extras: Vec::new() });

    let archive_ctx = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
    let bucket = fetch(&manifest_ref, &archive_ctx, &fetch_ctx, &env).unwrap();
    assert_eq!(read_all(bucket.as_ref()).unwrap(), b"<html>welcome</html>");

    // Same archive, explicit path this time — the internal entry resolves
    // through the ArchiveManager cache populated by the first fetch.
    let about_ref = ContentRef::with_path(manifest_ref.key.clone(), vec!["about.html".into()]);
    let archive_ctx2 = ArchiveContext::new(fetch_ctx.max_archive_levels, fetch_ctx.max_archive_restarts);
    let about_bucket = fetch(&about_ref, &archive_ctx2, &fetch_ctx, &env).unwrap();
    assert_eq!(read_all(about_bucket.as_ref()).unwrap(), b"<html>about</html>");
}
