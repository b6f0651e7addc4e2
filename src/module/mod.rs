//! 模块管理
//!
//! 包含模块容器的全部组件：
//! - 模块描述与解析
//! - 模块记录、状态变更锁和依赖注册表
//! - 生命周期控制器与更新卸载协调器
//! - 持久化存储、权限判定和事件分发

pub mod activator;
pub mod coordinator;
pub mod dependency;
pub mod events;
pub mod file_storage;
pub mod lifecycle;
pub mod manager;
pub mod metadata;
pub mod parser;
pub mod record;
pub mod registry;
pub mod security;
pub mod storage;
pub mod transition;

// 重导出常用类型
pub use activator::{
    ActivatorFactory, ActivatorRegistry, ModuleActivator, ModuleContext, NoopCleanup,
    ServiceCleanup,
};
pub use coordinator::UpdateUninstallCoordinator;
pub use dependency::{DependencyGraph, GraphResolver, Resolution, Resolver, Wire, WireKind};
pub use events::{
    ContainerEvent, EventDispatcher, EventPayload, EventSink, EventSubscription,
    LifecycleEventKind,
};
pub use file_storage::FileStorage;
pub use lifecycle::{Collaborators, LifecycleController};
pub use manager::{BatchReport, ModuleContainer, ModuleContainerBuilder};
pub use metadata::{
    CapabilityKind, FragmentHost, ModuleDescriptor, ModuleRequirement, ModuleState,
    PackageExport, PackageImport, PersistentFlags,
};
pub use parser::ModuleParser;
pub use record::{compare_start_order, sort_by_start_order, Module, ModuleInfo, TransitionTarget};
pub use registry::DependencyRegistry;
pub use security::{check_permissions, gate_from_config, PolicyGate, PrivilegeGate, Unrestricted};
pub use storage::{
    MemoryStorage, ModuleSource, ModuleStorage, PersistentRecord, StagedRecord, StorageOperation,
};
pub use transition::{with_owner, TransitionGuard, TransitionLock};
