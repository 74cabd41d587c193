use criterion::{black_box, criterion_group, criterion_main, Criterion};
use freetide::bucket::BucketFactory;
use freetide::fec::{bucket_of, FecCodec};
use freetide::metadata::{emit, ClientMetadata, Metadata, Target};
use freetide::{ContentRef, ContentURI};
use std::sync::Arc;

const BLOCK_LEN: usize = 32 * 1024;

fn bench_fec(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let factory = BucketFactory::new(dir.path().to_path_buf());
    let blocks: Vec<Vec<u8>> = (0..8).map(|i| vec![i as u8; BLOCK_LEN]).collect();
    let buckets: Vec<Arc<dyn freetide::Bucket>> = blocks.iter().map(|b| bucket_of(&factory, b).unwrap()).collect();

    c.bench_function("fec_encode_8x4_32k", |b| {
        b.iter(|| FecCodec::encode(black_box(&buckets), 4, BLOCK_LEN).unwrap())
    });

    let parity = FecCodec::encode(&buckets, 4, BLOCK_LEN).unwrap();
    let data_slots: Vec<_> = buckets.iter().enumerate()
        .map(|(i, b)| if i == 0 { freetide::fec::BlockSlot::Absent } else { freetide::fec::BlockSlot::Present(b.clone()) })
        .collect();
    let check_slots: Vec<_> = parity.iter().map(|p| freetide::fec::BlockSlot::Present(Arc::new(freetide::MemBucket::from_bytes(p.clone())) as Arc<dyn freetide::Bucket>)).collect();

    c.bench_function("fec_decode_1_missing_of_8", |b| {
        b.iter(|| FecCodec::decode(black_box(&data_slots), black_box(&check_slots), BLOCK_LEN).unwrap())
    });
}

fn bench_metadata(c: &mut Criterion) {
    let meta = Metadata::SimpleRedirect {
        target: Target::Uri(ContentRef::new(ContentURI::Chk { hash: [7u8; 32], crypto_params: Vec::new(), extras: Vec::new() })),
        client: ClientMetadata { mime: Some("text/html".into()), mime_params: None },
    };

    c.bench_function("metadata_emit", |b| b.iter(|| emit(black_box(&meta)).unwrap()));

    let blob = emit(&meta).unwrap();
    c.bench_function("metadata_parse", |b| b.iter(|| freetide::metadata::parse(black_box(&blob)).unwrap()));
}

criterion_group!(benches, bench_fec, bench_metadata);
criterion_main!(benches);
