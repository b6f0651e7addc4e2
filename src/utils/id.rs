//! 模块 ID 分配
//!
//! 模块 ID 为单调递增的 64 位整数：安装时分配一次，更新时保持不变，
//! 卸载后永久退役，绝不复用。

use std::sync::atomic::{AtomicU64, Ordering};

/// 模块 ID
pub type ModuleId = u64;

/// 模块 ID 分配器
///
/// 从给定的起始值开始递增分配。容器启动时会以持久化记录中的最大 ID 为基准
/// 调用 [`IdAllocator::observe`]，保证重启后也不会复用旧 ID。
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// 创建从 `first` 开始分配的分配器
    pub fn starting_at(first: ModuleId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// 分配下一个 ID
    pub fn allocate(&self) -> ModuleId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// 记录一个已被使用的 ID，确保之后分配的 ID 都比它大
    pub fn observe(&self, used: ModuleId) {
        self.next.fetch_max(used.saturating_add(1), Ordering::SeqCst);
    }

    /// 查看下一个将要分配的 ID（不消耗）
    pub fn peek(&self) -> ModuleId {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        // 0 保留给容器自身
        Self::starting_at(1)
    }
}

/// 生成 UUID v4 格式的 ID
///
/// 用于事件 ID 等需要全局唯一性的场景
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
