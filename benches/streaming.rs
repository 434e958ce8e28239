use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use procgen_stream::core::StreamingConfig;
use procgen_stream::generation::procedural::uv_sphere;
use procgen_stream::scheduler::Scheduler;
use procgen_stream::streaming::{
    convert_mesh, BlockTransfer, CacheKey, DataKind, LooseFileStorage, MemoryContentCache, SharedBuffer,
    StorageBackend, StreamableBlock,
};

const BLOCK_SIZE: usize = 4096;
const BLOCK_COUNT: usize = 64;

fn bench_transfer_loose_files(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    let bytes: Vec<u8> = (0..BLOCK_SIZE * BLOCK_COUNT).map(|i| i as u8).collect();
    LooseFileStorage::new(dir.path()).write_file(DataKind::Model, 0, &bytes).expect("write bulk file");

    let scheduler = Scheduler::new(&StreamingConfig::default()).expect("scheduler");
    let backend = StorageBackend::bulk(Arc::new(LooseFileStorage::new(dir.path())));

    c.bench_function("transfer_64_blocks_loose", |b| {
        b.iter(|| {
            let dest = SharedBuffer::zeroed(BLOCK_SIZE * BLOCK_COUNT);
            let mut transfer = BlockTransfer::new(backend.clone());
            for i in 0..BLOCK_COUNT {
                let block = StreamableBlock::new(0, 0, (i * BLOCK_SIZE) as u64);
                transfer
                    .add_block(block, DataKind::Model, 0, dest.view(i * BLOCK_SIZE, BLOCK_SIZE))
                    .expect("add block");
            }
            let task = transfer.stream(&scheduler).expect("stream");
            black_box(scheduler.block_on(task.wait()))
        });
    });
}

fn bench_transfer_cache(c: &mut Criterion) {
    let cache = Arc::new(MemoryContentCache::new(BLOCK_COUNT));
    let key = CacheKey(1);
    let raw = vec![0x42u8; BLOCK_SIZE];
    let blocks: Vec<StreamableBlock> =
        (0..BLOCK_COUNT).map(|i| StreamableBlock::new(0, 0, (i * BLOCK_SIZE) as u64)).collect();
    for block in &blocks {
        cache.put_block(key, DataKind::Model, block, &raw);
    }

    let scheduler = Scheduler::new(&StreamingConfig::default()).expect("scheduler");
    let backend = StorageBackend::cache(cache, key);

    c.bench_function("transfer_64_blocks_cache", |b| {
        b.iter(|| {
            let dest = SharedBuffer::zeroed(BLOCK_SIZE * BLOCK_COUNT);
            let mut transfer = BlockTransfer::new(backend.clone());
            for (i, block) in blocks.iter().enumerate() {
                transfer
                    .add_block(*block, DataKind::Model, 0, dest.view(i * BLOCK_SIZE, BLOCK_SIZE))
                    .expect("add block");
            }
            let task = transfer.stream(&scheduler).expect("stream");
            black_box(scheduler.block_on(task.wait()))
        });
    });
}

fn bench_convert_mesh(c: &mut Criterion) {
    let dense = uv_sphere(128, 192, 1.0, true);
    let sparse = uv_sphere(16, 24, 1.0, true);

    c.bench_function("convert_mesh_dense", |b| {
        b.iter(|| black_box(convert_mesh(black_box(&dense), Some(2))));
    });

    c.bench_function("convert_mesh_sparse", |b| {
        b.iter(|| black_box(convert_mesh(black_box(&sparse), Some(2))));
    });
}

criterion_group!(benches, bench_transfer_loose_files, bench_transfer_cache, bench_convert_mesh);
criterion_main!(benches);
