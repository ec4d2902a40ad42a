//! Benchmarks for HNSW index build and search.
//!
//! Run with: `cargo bench`

use criterion::{criterion_group, criterion_main, Criterion};
use gatedhnsw::vector::{BuildInput, HnswIndex, IndexBuilder, SearchObservationContext};
use gatedhnsw::vector::Filter;
use gatedhnsw::{ChunkId, DocumentId, HnswParams, Metadata, TenantId};

const DIM: usize = 384;

fn make_vector(seed: u64) -> Vec<f32> {
    (0..DIM)
        .map(|i| (seed as f32 * 0.1 + i as f32 * 0.01).sin())
        .collect()
}

fn build_input(n: usize) -> BuildInput {
    let document_id = DocumentId::new();
    BuildInput {
        vectors: (0..n).map(|i| make_vector(i as u64)).collect(),
        chunk_ids: (0..n).map(|_| ChunkId::new()).collect(),
        document_ids: (0..n).map(|_| document_id).collect(),
        metadatas: (0..n).map(|_| Metadata::new()).collect(),
    }
}

/// Benchmark a cold-start batch build of 1,000 chunks.
fn bench_build_index(c: &mut Criterion) {
    c.bench_function("build_index_1000", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;

            for _ in 0..iters {
                let builder = IndexBuilder::new(TenantId::new(), HnswParams::default());
                let input = build_input(1000);

                let start = std::time::Instant::now();
                let (_index, _report) = builder.build(input, None).unwrap();
                total += start.elapsed();
            }

            total
        });
    });
}

/// Benchmark searching a pre-built index of 10,000 chunks.
fn bench_search(c: &mut Criterion) {
    let builder = IndexBuilder::new(TenantId::new(), HnswParams::default());
    let (index, _report) = builder.build(build_input(10_000), None).unwrap();
    let query = make_vector(42);
    let filter = Filter::none();
    let observation = SearchObservationContext::default();

    c.bench_function("search_10000", |b| {
        b.iter(|| index.search(&query, 10, None, &filter, &observation, None));
    });
}

criterion_group!(benches, bench_build_index, bench_search);
criterion_main!(benches);
