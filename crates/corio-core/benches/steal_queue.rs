use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use corio_core::StealQueue;

fn bench_push_pop(c: &mut Criterion) {
    let q = StealQueue::new(1024);
    c.bench_function("steal_queue/owner_push_pop", |b| {
        b.iter(|| {
            q.push(black_box(1u64));
            black_box(q.pop());
        })
    });
}

fn bench_contended_steal(c: &mut Criterion) {
    c.bench_function("steal_queue/push_pop_with_thieves", |b| {
        let q = Arc::new(StealQueue::new(1024));
        let stop = Arc::new(AtomicBool::new(false));
        let thieves: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        black_box(q.steal());
                    }
                })
            })
            .collect();

        b.iter(|| {
            q.push(black_box(1u64));
            black_box(q.pop());
        });

        stop.store(true, Ordering::Release);
        for t in thieves {
            t.join().unwrap();
        }
        while q.pop().is_some() {}
    });
}

criterion_group!(benches, bench_push_pop, bench_contended_steal);
criterion_main!(benches);
