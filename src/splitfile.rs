//! Splitfile engine: segmentation, concurrent block I/O, and FEC-protected
//! reassembly/insertion.
//!
//! Grounded on the teacher's [`crate::io_stream`] module (chunking on the
//! insert side, forward scan-then-read on the fetch side), generalized from
//! a single CAS-dedup stream format to the wire splitfile's two-sided
//! (data + parity) block layout. Block fetch/insert is delegated to
//! [`BlockFetcher`]/[`BlockInserter`] — the peer-to-peer transport this
//! crate treats as an external collaborator.

use crate::bucket::{read_all, Bucket, BucketFactory};
use crate::compression::get_codec;
use crate::context::{FetchContext, FetchEvent, InsertContext};
use crate::error::FetchError;
use crate::fec::{bucket_of, BlockSlot, FecCodec, FecJob, FecQueue};
use crate::metadata::{FecAlgorithm, SegmentParams, Splitfile};
use crate::uri::RoutingKey;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// A splitfile block is always exactly this many bytes on the wire; the
/// final block of a payload is zero-padded to it and truncated back to
/// `data_length` on the way out.
pub const DEFAULT_BLOCK_LEN: usize = 32 * 1024;

pub trait BlockFetcher: Send + Sync {
    fn fetch_block(&self, key: &RoutingKey) -> Result<Arc<dyn Bucket>, FetchError>;
}

pub trait BlockInserter: Send + Sync {
    fn insert_block(&self, data: &[u8]) -> Result<RoutingKey, FetchError>;
}

type FetchCache = Mutex<HashMap<RoutingKey, Arc<dyn Bucket>>>;

fn fetch_one(
    fetcher: &dyn BlockFetcher,
    key: &RoutingKey,
    ctx: &FetchContext,
    cache: &FetchCache,
) -> Option<Arc<dyn Bucket>> {
    if let Some(hit) = cache.lock().unwrap().get(key).cloned() {
        return Some(hit);
    }
    for attempt in 0..=ctx.max_splitfile_block_retries {
        match fetcher.fetch_block(key) {
            Ok(bucket) => {
                ctx.event_sink.on_event(FetchEvent::BlockReceived { key: *key });
                cache.lock().unwrap().insert(*key, bucket.clone());
                return Some(bucket);
            }
            Err(e) => {
                ctx.event_sink.on_event(FetchEvent::BlockFailed { key: *key, reason: e.to_string() });
                if attempt == ctx.max_splitfile_block_retries {
                    return None;
                }
            }
        }
    }
    None
}

/// Fetch `keys` concurrently, bounded to `ctx.max_splitfile_workers` threads
/// in flight at once. Repeated keys within the same splitfile are satisfied
/// from `cache` rather than fetched twice.
fn fetch_keys_concurrent(
    fetcher: &dyn BlockFetcher,
    keys: &[RoutingKey],
    ctx: &FetchContext,
    cache: &FetchCache,
) -> Vec<Option<Arc<dyn Bucket>>> {
    let width = ctx.max_splitfile_workers.max(1);
    let mut results = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(width) {
        let chunk_results: Vec<Option<Arc<dyn Bucket>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk.iter()
                .map(|key| scope.spawn(|| fetch_one(fetcher, key, ctx, cache)))
                .collect();
            handles.into_iter().map(|h| h.join().expect("fetch worker panicked")).collect()
        });
        results.extend(chunk_results);
    }
    results
}

fn run_decode_job(
    queue: &Arc<FecQueue>,
    data_slots: Vec<BlockSlot>,
    check_slots: Vec<BlockSlot>,
    block_len: usize,
) -> Result<Vec<Arc<dyn Bucket>>, FetchError> {
    let (tx, rx) = std::sync::mpsc::channel();
    let job = FecJob::new(4, false, queue.next_added_at(), Box::new(move || {
        let _ = tx.send(FecCodec::decode(&data_slots, &check_slots, block_len));
    }));
    queue.enqueue(job);
    rx.recv().map_err(|_| FetchError::Internal("FEC worker dropped without a result".into()))?
        .map_err(FetchError::from)
}

fn run_encode_job(
    queue: &Arc<FecQueue>,
    data_blocks: Vec<Arc<dyn Bucket>>,
    m: usize,
    block_len: usize,
) -> Result<Vec<Vec<u8>>, FetchError> {
    let (tx, rx) = std::sync::mpsc::channel();
    let job = FecJob::new(4, false, queue.next_added_at(), Box::new(move || {
        let _ = tx.send(FecCodec::encode(&data_blocks, m, block_len));
    }));
    queue.enqueue(job);
    rx.recv().map_err(|_| FetchError::Internal("FEC worker dropped without a result".into()))?
        .map_err(FetchError::from)
}

/// Fetch and reassemble a splitfile's payload per §4.2: partition into
/// segments, fetch/decode each in turn, then undo compression if present.
pub fn fetch_splitfile(
    sf: &Splitfile,
    fetcher: &dyn BlockFetcher,
    factory: &BucketFactory,
    queue: &Arc<FecQueue>,
    ctx: &FetchContext,
) -> Result<Arc<dyn Bucket>, FetchError> {
    let segment_size = sf.params.segment_size.max(1) as usize;
    let check_segment_size = sf.params.check_segment_size.max(1) as usize;
    let num_segments = sf.data_keys.len().div_ceil(segment_size).max(1);
    let cache: FetchCache = Mutex::new(HashMap::new());

    if sf.data_length > ctx.max_output_len {
        return Err(FetchError::TooBig { got: sf.data_length, cap: ctx.max_output_len });
    }

    let raw = factory.make(sf.data_length)?;
    let mut remaining = sf.data_length;
    {
        let mut writer = raw.writer()?;
        for seg_idx in 0..num_segments {
            let data_start = seg_idx * segment_size;
            let data_end = (data_start + segment_size).min(sf.data_keys.len());
            if data_start >= data_end {
                break;
            }
            let data_keys_seg = &sf.data_keys[data_start..data_end];

            let data_fetched = fetch_keys_concurrent(fetcher, data_keys_seg, ctx, &cache);
            let missing = data_fetched.iter().filter(|r| r.is_none()).count();

            let resolved: Vec<Arc<dyn Bucket>> = if missing == 0 {
                data_fetched.into_iter().map(|o| o.unwrap()).collect()
            } else {
                let check_start = seg_idx * check_segment_size;
                let check_end = (check_start + check_segment_size).min(sf.check_keys.len());
                let check_keys_seg = &sf.check_keys[check_start..check_end];
                let check_fetched = fetch_keys_concurrent(fetcher, check_keys_seg, ctx, &cache);

                let present = data_fetched.iter().filter(|r| r.is_some()).count()
                    + check_fetched.iter().filter(|r| r.is_some()).count();
                if present < data_keys_seg.len() {
                    ctx.event_sink.on_event(FetchEvent::FetchFailed {
                        reason: format!("segment {seg_idx} unrecoverable: {present}/{} blocks", data_keys_seg.len()),
                    });
                    return Err(FetchError::SplitfileSegmentUnrecoverable);
                }

                let data_slots = data_fetched.into_iter()
                    .map(|o| o.map(BlockSlot::Present).unwrap_or(BlockSlot::Absent))
                    .collect();
                let check_slots = check_fetched.into_iter()
                    .map(|o| o.map(BlockSlot::Present).unwrap_or(BlockSlot::Absent))
                    .collect();
                run_decode_job(queue, data_slots, check_slots, DEFAULT_BLOCK_LEN)?
            };

            for bucket in &resolved {
                let bytes = read_all(bucket.as_ref())?;
                let take = (bytes.len() as u64).min(remaining) as usize;
                writer.write_all(&bytes[..take])?;
                remaining -= take as u64;
            }
            ctx.event_sink.on_event(FetchEvent::SegmentDecoded { segment_index: seg_idx });
        }
    }

    let Some((codec_id, decompressed_len)) = sf.compression else {
        return Ok(raw);
    };

    if decompressed_len > ctx.max_output_len {
        return Err(FetchError::TooBig { got: decompressed_len, cap: ctx.max_output_len });
    }
    let codec = get_codec(crate::compression::CompressionCodecId::from_metadata_id(codec_id)
        .ok_or(FetchError::Metadata(crate::error::MetadataError::UnknownCodec(codec_id)))?);
    let compressed_bytes = read_all(raw.as_ref())?;
    let decompressed = codec.decompress_capped(&compressed_bytes, ctx.max_output_len)
        .map_err(|e| FetchError::Internal(e.to_string()))?;
    if decompressed.len() as u64 > ctx.max_output_len {
        return Err(FetchError::TooBig { got: decompressed.len() as u64, cap: ctx.max_output_len });
    }
    let out = factory.make(decompressed.len() as u64)?;
    crate::bucket::write_all(out.as_ref(), &decompressed)?;
    ctx.event_sink.on_event(FetchEvent::FetchCompleted { bytes: decompressed.len() as u64 });
    Ok(out)
}

fn insert_one(
    inserter: &dyn BlockInserter,
    data: &[u8],
    max_retries: u32,
) -> Result<RoutingKey, FetchError> {
    let mut last_err = None;
    for _ in 0..=max_retries {
        match inserter.insert_block(data) {
            Ok(key) => return Ok(key),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(FetchError::Internal("insert retries exhausted".into())))
}

fn insert_blocks_concurrent(
    inserter: &dyn BlockInserter,
    blocks: &[&[u8]],
    max_workers: usize,
    max_retries: u32,
) -> Result<Vec<RoutingKey>, FetchError> {
    let width = max_workers.max(1);
    let mut keys = Vec::with_capacity(blocks.len());
    for chunk in blocks.chunks(width) {
        let chunk_results: Vec<Result<RoutingKey, FetchError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk.iter()
                .map(|b| scope.spawn(|| insert_one(inserter, b, max_retries)))
                .collect();
            handles.into_iter().map(|h| h.join().expect("insert worker panicked")).collect()
        });
        for r in chunk_results {
            keys.push(r?);
        }
    }
    Ok(keys)
}

/// Compress (optionally), segment, encode parity, and insert a payload as a
/// splitfile per §4.3.
pub fn insert_splitfile(
    data: &[u8],
    inserter: &dyn BlockInserter,
    factory: &BucketFactory,
    queue: &Arc<FecQueue>,
    fetch_ctx: &FetchContext,
    insert_ctx: &InsertContext,
) -> Result<Splitfile, FetchError> {
    let (payload, compression) = if insert_ctx.compression_level > 0 {
        let codec = get_codec(insert_ctx.default_codec);
        let compressed = codec.compress(data, insert_ctx.compression_level)
            .map_err(|e| FetchError::Internal(e.to_string()))?;
        if compressed.len() < data.len() {
            (compressed, Some((insert_ctx.default_codec.metadata_id(), data.len() as u64)))
        } else {
            (data.to_vec(), None)
        }
    } else {
        (data.to_vec(), None)
    };

    let blocks: Vec<&[u8]> = if payload.is_empty() {
        vec![&payload[..]]
    } else {
        payload.chunks(DEFAULT_BLOCK_LEN).collect()
    };

    let seg_data = (insert_ctx.splitfile_segment_data_blocks as usize).max(1);
    let seg_check = (insert_ctx.splitfile_segment_check_blocks as usize).max(1);
    let num_segments = blocks.len().div_ceil(seg_data).max(1);

    let mut all_data_keys = Vec::with_capacity(blocks.len());
    let mut all_check_keys = Vec::new();

    for seg_idx in 0..num_segments {
        let start = seg_idx * seg_data;
        let end = (start + seg_data).min(blocks.len());
        if start >= end {
            break;
        }
        let seg_blocks = &blocks[start..end];

        let data_buckets: Vec<Arc<dyn Bucket>> = seg_blocks.iter()
            .map(|b| bucket_of(factory, b))
            .collect::<std::io::Result<_>>()?;

        let data_keys = insert_blocks_concurrent(inserter, seg_blocks, fetch_ctx.max_splitfile_workers, insert_ctx.max_insert_retries)?;
        all_data_keys.extend(data_keys);

        let m = seg_check.min(seg_blocks.len().max(1));
        let parity = run_encode_job(queue, data_buckets, m, DEFAULT_BLOCK_LEN)?;
        let parity_refs: Vec<&[u8]> = parity.iter().map(|v| v.as_slice()).collect();
        let check_keys = insert_blocks_concurrent(inserter, &parity_refs, fetch_ctx.max_splitfile_workers, insert_ctx.max_insert_retries)?;
        all_check_keys.extend(check_keys);
    }

    Ok(Splitfile {
        algorithm: FecAlgorithm::OnionStandard,
        data_keys: all_data_keys,
        check_keys: all_check_keys,
        data_length: data.len() as u64,
        params: SegmentParams { segment_size: seg_data as u32, check_segment_size: seg_check as u32 },
        compression,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::FecQueue;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct MemStore {
        blocks: StdMutex<StdHashMap<RoutingKey, Vec<u8>>>,
    }

    impl MemStore {
        fn new() -> Self { Self { blocks: StdMutex::new(StdHashMap::new()) } }
    }

    impl BlockFetcher for MemStore {
        fn fetch_block(&self, key: &RoutingKey) -> Result<Arc<dyn Bucket>, FetchError> {
            let guard = self.blocks.lock().unwrap();
            let bytes = guard.get(key).ok_or_else(|| FetchError::BlockNotFound(hex::encode(key)))?;
            Ok(Arc::new(crate::bucket::MemBucket::from_bytes(bytes.clone())))
        }
    }

    impl BlockInserter for MemStore {
        fn insert_block(&self, data: &[u8]) -> Result<RoutingKey, FetchError> {
            let key: RoutingKey = *blake3::hash(data).as_bytes();
            self.blocks.lock().unwrap().insert(key, data.to_vec());
            Ok(key)
        }
    }

    #[test]
    fn round_trip_small_payload_no_missing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BucketFactory::new(dir.path().to_path_buf());
        let queue = FecQueue::new(2, 16);
        let store = MemStore::new();
        let fetch_ctx = FetchContext::default();
        let insert_ctx = InsertContext { compression_level: 0, ..InsertContext::default() };

        let payload = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let sf = insert_splitfile(&payload, &store, &factory, &queue, &fetch_ctx, &insert_ctx).unwrap();
        assert!(!sf.data_keys.is_empty());

        let restored = fetch_splitfile(&sf, &store, &factory, &queue, &fetch_ctx).unwrap();
        assert_eq!(read_all(restored.as_ref()).unwrap(), payload);
    }

    #[test]
    fn oversized_data_length_rejected_before_allocating() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BucketFactory::new(dir.path().to_path_buf());
        let queue = FecQueue::new(2, 16);
        let store = MemStore::new();
        let fetch_ctx = FetchContext { max_output_len: 10, ..FetchContext::default() };

        let sf = Splitfile {
            algorithm: FecAlgorithm::OnionStandard,
            data_keys: Vec::new(),
            check_keys: Vec::new(),
            data_length: 1_000_000,
            params: SegmentParams { segment_size: 128, check_segment_size: 32 },
            compression: None,
        };
        let result = fetch_splitfile(&sf, &store, &factory, &queue, &fetch_ctx);
        assert!(matches!(result, Err(FetchError::TooBig { got: 1_000_000, cap: 10 })));
    }

    #[test]
    fn round_trip_survives_one_missing_data_block_per_segment() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BucketFactory::new(dir.path().to_path_buf());
        let queue = FecQueue::new(2, 16);
        let store = MemStore::new();
        let fetch_ctx = FetchContext::default();
        let insert_ctx = InsertContext {
            compression_level: 0,
            splitfile_segment_data_blocks: 4,
            splitfile_segment_check_blocks: 2,
            ..InsertContext::default()
        };

        let payload: Vec<u8> = (0..(DEFAULT_BLOCK_LEN * 4)).map(|i| (i % 223) as u8).collect();
        let sf = insert_splitfile(&payload, &store, &factory, &queue, &fetch_ctx, &insert_ctx).unwrap();
        assert_eq!(sf.data_keys.len(), 4, "blocks must hash to distinct keys for this test to be meaningful");

        // Drop the first data block so the fetch must reconstruct via parity.
        store.blocks.lock().unwrap().remove(&sf.data_keys[0]);

        let restored = fetch_splitfile(&sf, &store, &factory, &queue, &fetch_ctx).unwrap();
        assert_eq!(read_all(restored.as_ref()).unwrap(), payload);
    }
}
