//! Performance benchmarks for the lockstep synchronization core.
//!
//! Run with: `cargo bench`
//! Or for a specific bench: `cargo bench --bench sync_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lockstep::event::Activity;
use lockstep::{Engine, EngineConfig, Event, LinkSpec, RankInfo, TimeVortex};

// ============================================================================
// TimeVortex
// ============================================================================

fn bench_vortex_insert_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("vortex");

    for size in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("insert_pop", size), &size, |b, &size| {
            b.iter(|| {
                let mut vortex = TimeVortex::new();
                for i in 0..size {
                    // Reversed times stress the heap ordering.
                    let event = Event {
                        link_id: 1,
                        delivery_time: size - i,
                        priority: 0,
                        payload: Vec::new(),
                    };
                    vortex.insert(size - i, 0, Activity::Event(event));
                }
                while let Some(scheduled) = vortex.pop() {
                    black_box(scheduled.key.time);
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Two-thread epoch churn
// ============================================================================

fn two_thread_ping(rounds: u64) {
    const PING: u64 = 1;
    const PONG: u64 = 2;
    const DRIVER: u64 = 3;

    let mut engine = Engine::new(0, EngineConfig::threads(2, 50), None).unwrap();
    let thread0 = RankInfo::new(0, 0);
    let thread1 = RankInfo::new(0, 1);

    let driver = engine
        .connect(LinkSpec::new(DRIVER, thread0, thread0, 0))
        .unwrap()
        .unwrap();
    let ping = engine
        .connect(LinkSpec::new(PING, thread0, thread1, 50))
        .unwrap()
        .unwrap();
    let pong = engine
        .connect(LinkSpec::new(PONG, thread1, thread0, 50))
        .unwrap()
        .unwrap();

    let exit = engine.exit();
    exit.ref_inc(1, 0);

    {
        let ping = std::sync::Arc::clone(&ping);
        engine
            .register_handler(0, DRIVER, move |_| {
                ping.send(0, Event::new(vec![0, 0, 0, 0, 0, 0, 0, 0]));
            })
            .unwrap();
    }
    engine
        .register_handler(1, PING, move |event| {
            pong.send(0, Event::new(event.payload));
        })
        .unwrap();
    {
        let exit = engine.exit();
        engine
            .register_handler(0, PONG, move |mut event| {
                let round = u64::from_le_bytes(event.payload[..8].try_into().unwrap());
                if round + 1 < rounds {
                    event.payload[..8].copy_from_slice(&(round + 1).to_le_bytes());
                    ping.send(0, event);
                } else {
                    exit.ref_dec(1, 0);
                }
            })
            .unwrap();
    }

    driver.send(10, Event::new(Vec::new()));
    let report = engine.run(u64::MAX).unwrap();
    black_box(report.events_delivered);
}

fn bench_thread_sync_epochs(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_sync");
    group.sample_size(10);

    for rounds in [10u64, 100] {
        group.throughput(Throughput::Elements(rounds));
        group.bench_with_input(
            BenchmarkId::new("two_thread_ping", rounds),
            &rounds,
            |b, &rounds| b.iter(|| two_thread_ping(rounds)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_vortex_insert_pop, bench_thread_sync_epochs);
criterion_main!(benches);
