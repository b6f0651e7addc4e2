//! 生命周期性能基准测试
//!
//! 使用 Criterion 框架进行性能测试，包括：
//! - 无竞争的状态变更锁占有与释放
//! - 启动/停止往返
//! - 按启动级别批量启动和停止

use chips_container::module::{with_owner, TransitionLock};
use chips_container::{
    ActivatorRegistry, ContainerConfig, ModuleActivator, ModuleContainer, ModuleContext,
    ModuleDescriptor, ModuleSource,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// 测试辅助结构
// ============================================================================

/// 基准测试用的空激活器
struct NoopActivator;

#[async_trait::async_trait]
impl ModuleActivator for NoopActivator {
    async fn start(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn container_with_modules(count: usize) -> ModuleContainer {
    let activators = ActivatorRegistry::new();
    activators.register_shared("noop", Arc::new(NoopActivator));
    let container = ModuleContainer::new(ContainerConfig::default(), Arc::new(activators))
        .await
        .unwrap();
    for i in 0..count {
        let module = container
            .install(
                &format!("mem:bench-{}", i),
                ModuleSource::Descriptor(
                    ModuleDescriptor::new(format!("bench.m{}", i), "1.0.0").with_activator("noop"),
                ),
            )
            .await
            .unwrap();
        container
            .set_module_start_level(module.id(), (i % 4) as i32 + 1)
            .await
            .unwrap();
    }
    container
}

// ============================================================================
// 状态变更锁基准测试
// ============================================================================

/// 无竞争占有与释放
fn transition_lock_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let lock = TransitionLock::new();

    c.bench_function("transition_lock_uncontended", |b| {
        b.to_async(&rt).iter(|| async {
            with_owner(async {
                let guard = lock.acquire(1, Duration::from_millis(5000)).await.unwrap();
                black_box(&guard);
            })
            .await
        })
    });
}

// ============================================================================
// 生命周期基准测试
// ============================================================================

/// 单个模块启动停止往返
fn start_stop_round_trip_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let container = rt.block_on(container_with_modules(1));

    c.bench_function("start_stop_round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            container.start(1, false).await.unwrap();
            container.stop(1, false).await.unwrap();
        })
    });
}

/// 按启动级别批量启动和停止
fn batch_start_stop_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("batch_start_stop");

    for count in [8usize, 64, 256] {
        let container = rt.block_on(container_with_modules(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.to_async(&rt).iter(|| async {
                let started = container.start_all().await.unwrap();
                let stopped = container.stop_all().await.unwrap();
                black_box((started, stopped));
            })
        });
    }
    group.finish();
}

criterion_group!(
    name = lock_benches;
    config = Criterion::default().sample_size(100);
    targets = transition_lock_benchmark
);

criterion_group!(
    name = lifecycle_benches;
    config = Criterion::default().sample_size(50);
    targets = start_stop_round_trip_benchmark, batch_start_stop_benchmark
);

criterion_main!(lock_benches, lifecycle_benches);
