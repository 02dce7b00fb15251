use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use sync_prims::{Accessor, ConcurrentMap, ConstAccessor};

fn lcg(mut s: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some(s)
    })
}

fn key(n: u64) -> String {
    format!("k{:016x}", n)
}

fn filled(n: usize, seed: u64) -> (ConcurrentMap<String, u64>, Vec<String>) {
    let m = ConcurrentMap::new();
    let keys: Vec<String> = lcg(seed).take(n).map(key).collect();
    for (i, k) in keys.iter().enumerate() {
        m.insert_entry(k.clone(), i as u64);
    }
    (m, keys)
}

fn bench_insert_fresh_100k(c: &mut Criterion) {
    c.bench_function("map::insert_fresh_100k", |b| {
        b.iter_batched(
            ConcurrentMap::<String, u64>::new,
            |m| {
                for (i, x) in lcg(1).take(100_000).enumerate() {
                    let mut acc = Accessor::new();
                    m.insert(&mut acc, key(x), i as u64);
                }
                black_box(m)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_find_hit_10k(c: &mut Criterion) {
    let (m, keys) = filled(100_000, 7);
    // Precompute 10k random query keys using LCG
    let n = keys.len();
    let mut s = 0x9e3779b97f4a7c15u64;
    let queries: Vec<String> = (0..10_000)
        .map(|_| {
            s = s.wrapping_mul(2862933555777941757).wrapping_add(3037000493);
            keys[(s as usize) % n].clone()
        })
        .collect();
    c.bench_function("map::find_hit_10k_on_100k", |b| {
        b.iter(|| {
            let mut acc = ConstAccessor::new();
            for k in &queries {
                black_box(m.find(&mut acc, k.as_str()));
            }
        })
    });
}

fn bench_find_miss_10k(c: &mut Criterion) {
    let (m, _) = filled(100_000, 11);
    let misses: Vec<String> = lcg(0xdead_beef).take(10_000).map(key).collect();
    c.bench_function("map::find_miss_10k_on_100k", |b| {
        b.iter(|| {
            let mut acc = ConstAccessor::new();
            for k in &misses {
                black_box(m.find(&mut acc, k.as_str()));
            }
        })
    });
}

fn bench_parallel_increment(c: &mut Criterion) {
    let (m, keys) = filled(1_024, 21);
    let m = Arc::new(m);
    let keys = Arc::new(keys);
    c.bench_function("map::parallel_increment_4x10k", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4u64)
                .map(|t| {
                    let (m, keys) = (m.clone(), keys.clone());
                    thread::spawn(move || {
                        let mut acc = Accessor::new();
                        for x in lcg(t + 1).take(10_000) {
                            let k = &keys[(x as usize) % keys.len()];
                            if m.find(&mut acc, k.as_str()) {
                                if let Some(v) = acc.value_mut() {
                                    *v = v.wrapping_add(1);
                                }
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                let _ = h.join();
            }
        })
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(12)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1))
}

criterion_group! {
    name = benches_insert;
    config = bench_config();
    targets = bench_insert_fresh_100k
}

criterion_group! {
    name = benches_lookup;
    config = bench_config();
    targets = bench_find_hit_10k, bench_find_miss_10k, bench_parallel_increment
}

criterion_main!(benches_insert, benches_lookup);
