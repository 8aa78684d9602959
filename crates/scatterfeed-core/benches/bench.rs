use core::time::Duration;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use scatterfeed_core::{
    expiry::{Drainable, ExpiringMap, ExpiryPolicy},
    ids::{RequestIdGenerator, SequenceIdGenerator},
};
use std::hint::black_box;

struct Cursor {
    pos: usize,
    len: usize,
}

impl Drainable for Cursor {
    fn is_drained(&self) -> bool {
        self.pos >= self.len
    }
}

fn bench_update(c: &mut Criterion) {
    let policy = ExpiryPolicy::new(Duration::from_secs(1800), Duration::from_secs(300));
    let map = ExpiringMap::new(policy);
    let ids = SequenceIdGenerator::with_nonce("bench", 0);
    let keys: Vec<String> = (0..1024).map(|_| ids.next_id()).collect();
    for key in &keys {
        map.insert(key.clone(), Cursor { pos: 0, len: usize::MAX });
    }

    let mut group = c.benchmark_group("expiring_map");
    group.throughput(Throughput::Elements(1));
    group.bench_function("update", |b| {
        let mut i = 0;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            i += 1;
            black_box(map.update(key, |cursor| {
                cursor.pos += 5;
                cursor.pos
            }))
        });
    });
    group.bench_function("sweep_1024_live", |b| {
        b.iter(|| black_box(map.sweep()));
    });
    group.finish();
}

criterion_group!(benches, bench_update);
criterion_main!(benches);
