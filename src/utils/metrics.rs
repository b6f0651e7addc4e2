//! 生命周期指标
//!
//! 统计状态转换、失败、回滚和锁等待等指标，供运维排查使用。
//!
//! # 示例
//!
//! ```rust
//! use chips_container::utils::metrics::LifecycleMetrics;
//!
//! let metrics = LifecycleMetrics::new();
//! metrics.record_start();
//! assert_eq!(metrics.snapshot().starts, 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// 生命周期指标收集器
///
/// 所有计数器使用 `AtomicU64`，可在任意任务中无锁更新。
#[derive(Debug)]
pub struct LifecycleMetrics {
    /// 成功启动次数
    starts: AtomicU64,
    /// 成功停止次数
    stops: AtomicU64,
    /// 激活器失败次数（启动或停止）
    activator_failures: AtomicU64,
    /// 成功更新次数
    updates: AtomicU64,
    /// 成功卸载次数
    uninstalls: AtomicU64,
    /// 执行过补偿回滚的事务数
    rollbacks: AtomicU64,
    /// 回滚自身失败的次数
    rollback_failures: AtomicU64,
    /// 状态变更锁超时次数
    lock_timeouts: AtomicU64,
    /// 状态变更锁等待总时长（微秒）
    lock_wait_us: AtomicU64,
    /// 收集开始时间
    start_time: DateTime<Utc>,
}

/// 指标快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub starts: u64,
    pub stops: u64,
    pub activator_failures: u64,
    pub updates: u64,
    pub uninstalls: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
    pub lock_timeouts: u64,
    pub lock_wait_us: u64,
    pub since: DateTime<Utc>,
}

impl LifecycleMetrics {
    /// 创建新的指标收集器
    pub fn new() -> Self {
        Self {
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
            activator_failures: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            uninstalls: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            rollback_failures: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            lock_wait_us: AtomicU64::new(0),
            start_time: Utc::now(),
        }
    }

    pub fn record_start(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stop(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activator_failure(&self) {
        self.activator_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uninstall(&self) {
        self.uninstalls.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次补偿回滚，`clean` 为 false 表示回滚本身也失败了
    pub fn record_rollback(&self, clean: bool) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        if !clean {
            self.rollback_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self, waited_us: u64) {
        self.lock_wait_us.fetch_add(waited_us, Ordering::Relaxed);
    }

    /// 获取当前指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            starts: self.starts.load(Ordering::Relaxed),
            stops: self.stops.load(Ordering::Relaxed),
            activator_failures: self.activator_failures.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            uninstalls: self.uninstalls.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            lock_wait_us: self.lock_wait_us.load(Ordering::Relaxed),
            since: self.start_time,
        }
    }
}

impl Default for LifecycleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = LifecycleMetrics::new();
        metrics.record_start();
        metrics.record_start();
        metrics.record_stop();
        metrics.record_rollback(true);
        metrics.record_rollback(false);
        metrics.record_lock_timeout();
        metrics.record_lock_wait(1500);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.starts, 2);
        assert_eq!(snapshot.stops, 1);
        assert_eq!(snapshot.rollbacks, 2);
        assert_eq!(snapshot.rollback_failures, 1);
        assert_eq!(snapshot.lock_timeouts, 1);
        assert_eq!(snapshot.lock_wait_us, 1500);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = LifecycleMetrics::new();
        metrics.record_update();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["updates"], 1);
    }
}
