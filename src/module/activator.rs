//! 模块激活器
//!
//! 模块描述中的 `activator` 字段是一个名称，容器通过 [`ActivatorRegistry`]
//! 找到对应的工厂，每次启动创建一个新实例，停止时调用同一个实例的 `stop`。

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::module::record::Module;
use crate::utils::ModuleId;

/// 模块激活器
///
/// 由模块提供。`start` 返回错误时模块回到 RESOLVED；`stop` 返回错误时
/// 清理照常进行，错误在清理之后交给调用方。
#[async_trait]
pub trait ModuleActivator: Send + Sync {
    /// 模块启动
    async fn start(&self, context: &ModuleContext) -> anyhow::Result<()>;

    /// 模块停止
    async fn stop(&self, context: &ModuleContext) -> anyhow::Result<()>;
}

/// 激活器工厂
pub type ActivatorFactory = Arc<dyn Fn() -> Arc<dyn ModuleActivator> + Send + Sync>;

/// 激活器调用时的上下文
#[derive(Debug, Clone)]
pub struct ModuleContext {
    module: Arc<Module>,
}

impl ModuleContext {
    pub fn new(module: Arc<Module>) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn module_id(&self) -> ModuleId {
        self.module.id()
    }

    /// 读取模块描述中的自定义属性
    pub fn property(&self, key: &str) -> Option<serde_json::Value> {
        self.module.revision().descriptor.properties.get(key).cloned()
    }
}

/// 激活器注册表
#[derive(Default)]
pub struct ActivatorRegistry {
    factories: RwLock<HashMap<String, ActivatorFactory>>,
}

impl fmt::Debug for ActivatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ActivatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工厂，同名工厂被替换
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ModuleActivator> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(activator = %name, "注册激活器");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(factory));
    }

    /// 注册共享实例，每次启动都使用同一个实例
    pub fn register_shared(&self, name: impl Into<String>, activator: Arc<dyn ModuleActivator>) {
        self.register(name, move || activator.clone());
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// 创建激活器实例，未注册时返回 `None`
    pub fn create(&self, name: &str) -> Option<Arc<dyn ModuleActivator>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()?;
        Some(factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// 已注册的名称（排序后）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// 模块停止或启动失败后释放它登记的服务、监听器和使用中的服务
pub trait ServiceCleanup: Send + Sync {
    fn release_module(&self, module: &Module);
}

/// 没有服务注册表时使用
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCleanup;

impl ServiceCleanup for NoopCleanup {
    fn release_module(&self, _module: &Module) {}
}
