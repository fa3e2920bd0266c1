use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::thread;

use corio_core::PoolAlloc;

fn bench_alloc_dealloc(c: &mut Criterion) {
    let pool: PoolAlloc<u64> = PoolAlloc::new(1024);
    c.bench_function("pool/alloc_dealloc", |b| {
        b.iter(|| {
            let p = pool.alloc(black_box(7u64));
            unsafe { pool.dealloc(p) };
        })
    });
}

fn bench_cross_thread_free(c: &mut Criterion) {
    c.bench_function("pool/cross_thread_free", |b| {
        b.iter_custom(|iters| {
            let pool: Arc<PoolAlloc<u64>> = Arc::new(PoolAlloc::new(1024));
            let (tx, rx) = std::sync::mpsc::channel::<usize>();
            let freer = {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for addr in rx {
                        let ptr = std::ptr::NonNull::new(addr as *mut u64).unwrap();
                        unsafe { pool.dealloc(ptr) };
                    }
                })
            };

            let start = std::time::Instant::now();
            for i in 0..iters {
                let p = pool.alloc(i);
                tx.send(p.as_ptr() as usize).unwrap();
            }
            drop(tx);
            freer.join().unwrap();
            start.elapsed()
        })
    });
}

criterion_group!(benches, bench_alloc_dealloc, bench_cross_thread_free);
criterion_main!(benches);
