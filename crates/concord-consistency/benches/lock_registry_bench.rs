//! Benchmarks for the lock registry grant path
//!
//! Measures uncontended grants, re-entry, and hierarchical conflict checks.

use std::hint::black_box;
use std::sync::Arc;

use concord_common::{ClassId, LockTarget, Serial};
use concord_consistency::{ClassHierarchy, LockOwner, LockRegistry, LockRequest, LockWait};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn hierarchy(depth: usize) -> Arc<ClassHierarchy> {
    let hierarchy = Arc::new(ClassHierarchy::new());
    hierarchy.register(ClassId::new("C0"), vec![]);
    for level in 1..depth {
        hierarchy.register(
            ClassId::new(format!("C{}", level)),
            vec![ClassId::new(format!("C{}", level - 1))],
        );
    }
    hierarchy
}

fn bench_lock_unlock_object(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let registry = LockRegistry::new(hierarchy(4));
    let owner = LockOwner::new(1, 1, Serial(1));
    let target = LockTarget::object("C3", 42);

    c.bench_function("lock_unlock_object", |b| {
        b.iter(|| {
            rt.block_on(async {
                let grant = registry
                    .lock(LockRequest::single(owner, target.clone()).with_wait(LockWait::NoWait))
                    .await
                    .unwrap();
                black_box(grant);
            });
            registry.unlock(&owner, std::slice::from_ref(&target));
        })
    });
}

fn bench_conflict_by_hierarchy_depth(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("class_conflict_depth");

    for depth in [2usize, 8, 32] {
        let registry = LockRegistry::new(hierarchy(depth));
        let holder = LockOwner::new(1, 1, Serial(1));
        let contender = LockOwner::new(2, 1, Serial(2));
        let leaf = format!("C{}", depth - 1);

        rt.block_on(registry.lock(LockRequest::single(holder, LockTarget::object(&leaf, 1))))
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let grant = registry
                        .lock(
                            LockRequest::single(contender, LockTarget::class("C0"))
                                .with_wait(LockWait::NoWait),
                        )
                        .await
                        .unwrap();
                    black_box(grant);
                })
            })
        });
    }
    group.finish();
}

fn bench_multi_target_grant(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let registry = LockRegistry::new(hierarchy(1));
    let owner = LockOwner::new(1, 1, Serial(1));
    let targets: Vec<LockTarget> = (0..32).rev().map(|id| LockTarget::object("C0", id)).collect();

    c.bench_function("lock_32_targets", |b| {
        b.iter(|| {
            rt.block_on(async {
                let grant = registry
                    .lock(LockRequest::new(owner, targets.clone()).with_wait(LockWait::NoWait))
                    .await
                    .unwrap();
                black_box(grant);
            });
            registry.unlock_all(&owner);
        })
    });
}

criterion_group!(
    benches,
    bench_lock_unlock_object,
    bench_conflict_by_hierarchy_depth,
    bench_multi_target_grant
);
criterion_main!(benches);
