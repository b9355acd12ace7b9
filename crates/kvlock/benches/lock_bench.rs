// Benchmarks for uncontended lock and semaphore round trips
// against the in-memory store

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use kvlock::{
    CancellationToken, LockCoordinator, LockOptions, SemaphoreCoordinator, SemaphoreOptions,
    SemaphoreManifest,
};
use kvlock_memstore::MemStore;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn bench_lock_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let store = MemStore::shared();
    let opts = LockOptions::new("bench/leader").with_lock_delay(Duration::ZERO);
    let lock = Arc::new(LockCoordinator::new(store, opts).expect("valid options"));
    let cancel = CancellationToken::new();

    c.bench_function("lock_acquire_release", |b| {
        b.to_async(&rt).iter(|| {
            let lock = Arc::clone(&lock);
            let cancel = cancel.clone();
            async move {
                let lease = lock.acquire(&cancel).await.expect("acquire");
                black_box(lease.lock_index());
                lock.release(&cancel).await.expect("release");
            }
        })
    });
}

fn bench_semaphore_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let store = MemStore::shared();
    let sem = Arc::new(
        SemaphoreCoordinator::new(store, SemaphoreOptions::new("bench/slots", 4))
            .expect("valid options"),
    );
    let cancel = CancellationToken::new();

    c.bench_function("semaphore_acquire_release", |b| {
        b.to_async(&rt).iter(|| {
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();
            async move {
                let lease = sem.acquire(&cancel).await.expect("acquire");
                black_box(lease.session().len());
                sem.release(&cancel).await.expect("release");
            }
        })
    });
}

fn bench_manifest_codec(c: &mut Criterion) {
    let mut manifest = SemaphoreManifest::new(64);
    for i in 0..32 {
        manifest.add(&format!("session-{:04}", i));
    }
    let encoded = manifest.encode().expect("encode");

    c.bench_function("manifest_encode", |b| {
        b.iter(|| black_box(manifest.encode().expect("encode")))
    });
    c.bench_function("manifest_decode", |b| {
        b.iter(|| black_box(SemaphoreManifest::decode("bench/.lock", &encoded).expect("decode")))
    });
}

criterion_group!(
    benches,
    bench_lock_acquire_release,
    bench_semaphore_acquire_release,
    bench_manifest_codec
);
criterion_main!(benches);
