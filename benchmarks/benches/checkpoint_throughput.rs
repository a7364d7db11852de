//! Benchmarks for atomic checkpoint write and read throughput

use bytes::Bytes;
use checkpoint::{CheckpointManager, LocalCheckpointManager, LocalCheckpointManagerConfig};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use run_core::Mapping;
use storage::atomic;
use tempfile::TempDir;

const SIZES: [usize; 3] = [1_000_000, 10_000_000, 100_000_000];

async fn open(dir: &TempDir, sync_parent_dir: bool) -> LocalCheckpointManager {
    let config = LocalCheckpointManagerConfig {
        base_path: dir.path().to_path_buf(),
        sync_parent_dir,
    };
    LocalCheckpointManager::open(config).await.unwrap()
}

fn checkpoint_save_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("checkpoint_save");
    group.sample_size(10);

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));

        for sync_parent_dir in [false, true] {
            let temp_dir = TempDir::new().unwrap();
            let manager = rt.block_on(open(&temp_dir, sync_parent_dir));
            let payload = Bytes::from(vec![0u8; size]);

            let label = if sync_parent_dir { "dir_sync" } else { "no_dir_sync" };
            group.bench_with_input(
                BenchmarkId::new(label, format!("{}MB", size / 1_000_000)),
                &payload,
                |b, payload| {
                    let manager = &manager;
                    b.to_async(&rt).iter(|| {
                        let payload = payload.clone();
                        async move {
                            manager
                                .save("bench_checkpoint", payload, Mapping::new())
                                .await
                                .unwrap();
                        }
                    });
                },
            );
        }
    }

    group.finish();
}

fn checkpoint_load_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("checkpoint_load");
    group.sample_size(10);

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));

        let temp_dir = TempDir::new().unwrap();
        let manager = rt.block_on(async {
            let manager = open(&temp_dir, false).await;
            manager
                .save("bench_checkpoint", Bytes::from(vec![0u8; size]), Mapping::new())
                .await
                .unwrap();
            manager
        });

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            let manager = &manager;
            b.to_async(&rt).iter(|| async move {
                manager.load("bench_checkpoint").await.unwrap();
            });
        });
    }

    group.finish();
}

fn small_record_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("atomic_record_write");
    let temp_dir = TempDir::new().unwrap();
    let record = br#"{"epoch":1,"step":100,"extra":{},"recorded_at":"2024-01-01T00:00:00Z"}"#;

    for sync_parent in [false, true] {
        group.bench_function(format!("sync_parent_{}", sync_parent), |b| {
            let dest = temp_dir.path().join("000000000000.json");
            b.iter(|| atomic::write_atomic(&dest, record, sync_parent).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    checkpoint_save_benchmark,
    checkpoint_load_benchmark,
    small_record_benchmark
);
criterion_main!(benches);
