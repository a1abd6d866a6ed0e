//! Performance benchmarks for the dispatch pipeline
//!
//! Resource assignment runs once per frame across every display, and a job
//! goes through acquire/release twice per frame. Both must stay far below
//! a vsync period.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hwc_dispatch::hrt::{self, HrtDisplay, HrtEngine, HrtLayer};
use hwc_dispatch::hwrm::sim::SimulatedResourceManager;
use hwc_dispatch::job::Rect;
use hwc_dispatch::pool::JobPool;
use hwc_dispatch::{BufferHandle, DisplayId, PixelFormat, VisibleLayer};

fn display(id: u32, max_inputs: usize, layer_count: usize) -> HrtDisplay {
    let layers = (0..layer_count)
        .map(|z| HrtLayer {
            wants_client_clear: z % 7 == 3,
            hw_eligible: z % 11 != 5,
            ..HrtLayer::plain()
        })
        .collect();
    HrtDisplay {
        display: DisplayId(id),
        max_inputs,
        connected: true,
        mirrored: false,
        supports_query: id % 2 == 0,
        layers,
    }
}

/// Benchmark the greedy tier with growing layer stacks
fn bench_simplified(c: &mut Criterion) {
    let mut group = c.benchmark_group("hrt_simplified");

    for layer_count in [4, 8, 16, 64].iter() {
        let input = display(0, 4, *layer_count);
        group.bench_with_input(
            format!("simplified_{}_layers_on_4_inputs", layer_count),
            &input,
            |b, input| b.iter(|| black_box(hrt::simplified(input))),
        );
    }

    group.finish();
}

/// Benchmark a full engine run with a batched placement query
fn bench_engine_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("hrt_engine");
    let sim = SimulatedResourceManager::new();
    let engine = HrtEngine::default();

    for display_count in [1u32, 2, 4].iter() {
        for id in 0..*display_count {
            sim.set_supports_query(DisplayId(id), id % 2 == 0);
        }
        let displays: Vec<_> = (0..*display_count).map(|id| display(id, 4, 12)).collect();
        group.bench_with_input(
            format!("run_{}_displays", display_count),
            &displays,
            |b, displays| b.iter(|| black_box(engine.run(displays, false, &sim))),
        );
    }

    group.finish();
}

/// Benchmark the per-frame job cycle through the pool
fn bench_pool_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_pool");

    group.bench_function("acquire_fill_release", |b| {
        b.iter_batched(
            || JobPool::new(DisplayId(0), 4, 5),
            |mut pool| {
                for frame in 0..10u64 {
                    let mut job = pool.acquire().unwrap();
                    for z in 0..6 {
                        job.push_layer(VisibleLayer::ui(
                            BufferHandle::new(frame * 8 + z, 1920, 1080, PixelFormat::Rgba8888),
                            Rect::new(0, 0, 1920, 1080),
                        ));
                    }
                    pool.release(black_box(job)).unwrap();
                }
                pool
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_simplified, bench_engine_run, bench_pool_cycle);
criterion_main!(benches);
