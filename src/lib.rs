//! # Chips Container - 薯片模块容器
//!
//! 动态模块容器，在运行时安装、解析、启动、停止、更新和卸载模块：
//!
//! - **生命周期**: INSTALLED / RESOLVED / STARTING / ACTIVE / STOPPING / UNINSTALLED 六个状态
//! - **状态变更锁**: 每个模块同一时刻只有一个转换在进行，等待有上限，重入直接失败
//! - **片段**: 片段的启动和停止重定向到它附着的宿主
//! - **事务更新与卸载**: 失败时按相反顺序执行补偿，恢复到操作前的状态
//! - **持久化**: 自动启动标志、启动级别和模块内容保存在数据目录中
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chips_container::{ActivatorRegistry, ContainerConfig, ModuleContainer, ModuleDescriptor, ModuleSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let container =
//!         ModuleContainer::new(ContainerConfig::default(), Arc::new(ActivatorRegistry::new())).await?;
//!
//!     let module = container
//!         .install(
//!             "mem:editor",
//!             ModuleSource::Descriptor(ModuleDescriptor::new("chips.editor", "1.0.0")),
//!         )
//!         .await?;
//!     container.start(module.id(), true).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 模块记录、生命周期、注册表、存储和事件
//! - `core` - 容器配置
//! - `utils` - 错误类型、日志、ID 和指标

#![warn(rustdoc::missing_crate_level_docs)]

pub mod core;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use module::{
    ActivatorRegistry, BatchReport, ContainerEvent, EventSubscription, LifecycleEventKind, Module,
    ModuleActivator, ModuleContainer, ModuleContainerBuilder, ModuleContext, ModuleDescriptor,
    ModuleInfo, ModuleSource, ModuleState, ModuleStorage, PersistentFlags,
};

pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use utils::{error_code, generate_uuid, CoreError, LifecycleMetrics, MetricsSnapshot, ModuleId, Result};

pub use core::config::{
    ContainerConfig, ContainerConfigBuilder, LifecycleConfig, LogConfig, SecurityConfig,
    StorageConfig,
};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
