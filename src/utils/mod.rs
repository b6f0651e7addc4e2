//! 工具模块
//!
//! 包含错误类型、ID 分配、日志系统和生命周期指标等通用工具。

pub mod error;
pub mod id;
pub mod logger;
pub mod metrics;

// 重导出常用类型
pub use error::{error_code, BoxError, CoreError, Result};
pub use id::{generate_uuid, IdAllocator, ModuleId};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use metrics::{LifecycleMetrics, MetricsSnapshot};
