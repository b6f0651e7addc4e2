//! 模块容器
//!
//! 整合注册表、存储、生命周期控制器和更新卸载协调器，对外提供统一的模块管理接口。
//! 所有公开的生命周期操作都在任务身份作用域内执行，用于识别重入。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::config::ContainerConfig;
use crate::module::activator::{ActivatorRegistry, NoopCleanup, ServiceCleanup};
use crate::module::coordinator::UpdateUninstallCoordinator;
use crate::module::dependency::{GraphResolver, Resolver};
use crate::module::events::{EventDispatcher, EventSink, EventSubscription, LifecycleEventKind};
use crate::module::file_storage::FileStorage;
use crate::module::lifecycle::{Collaborators, LifecycleController};
use crate::module::metadata::{ModuleState, PersistentFlags};
use crate::module::record::{Module, ModuleInfo};
use crate::module::registry::DependencyRegistry;
use crate::module::security::{gate_from_config, PrivilegeGate};
use crate::module::storage::{MemoryStorage, ModuleSource, ModuleStorage};
use crate::module::transition::{with_new_owner, with_owner};
use crate::utils::{CoreError, IdAllocator, LifecycleMetrics, MetricsSnapshot, ModuleId, Result};

/// 批量操作的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// 成功的模块
    pub succeeded: Vec<ModuleId>,
    /// 失败的模块和错误信息
    pub failed: Vec<(ModuleId, String)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, module_id: ModuleId, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(module_id),
            Err(e) => self.failed.push((module_id, e.to_string())),
        }
    }
}

/// 模块容器构建器
pub struct ModuleContainerBuilder {
    config: ContainerConfig,
    activators: Option<Arc<ActivatorRegistry>>,
    storage: Option<Arc<dyn ModuleStorage>>,
    resolver: Option<Arc<dyn Resolver>>,
    gate: Option<Arc<dyn PrivilegeGate>>,
    cleanup: Option<Arc<dyn ServiceCleanup>>,
}

impl ModuleContainerBuilder {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            activators: None,
            storage: None,
            resolver: None,
            gate: None,
            cleanup: None,
        }
    }

    pub fn activators(mut self, activators: Arc<ActivatorRegistry>) -> Self {
        self.activators = Some(activators);
        self
    }

    /// 指定存储，未指定时按 `storage.data_dir` 选择文件存储或内存存储
    pub fn storage(mut self, storage: Arc<dyn ModuleStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 指定权限判定，未指定时按 `security` 配置构建
    pub fn gate(mut self, gate: Arc<dyn PrivilegeGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn cleanup(mut self, cleanup: Arc<dyn ServiceCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// 构建容器
    ///
    /// 不会加载已持久化的模块，需要时调用 [`ModuleContainer::launch`]。
    pub async fn build(self) -> Result<ModuleContainer> {
        self.config.validate()?;

        let storage: Arc<dyn ModuleStorage> = match self.storage {
            Some(storage) => storage,
            None => match self.config.storage.data_dir {
                Some(ref dir) => Arc::new(FileStorage::open(dir).await?),
                None => Arc::new(MemoryStorage::new()),
            },
        };
        let gate = match self.gate {
            Some(gate) => gate,
            None => gate_from_config(&self.config.security)?,
        };
        let next_id = storage.load_next_id().await?;
        let events = Arc::new(EventDispatcher::new());
        let metrics = Arc::new(LifecycleMetrics::new());
        let registry = Arc::new(DependencyRegistry::new());

        let collaborators = Collaborators {
            registry,
            storage,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(GraphResolver::new()) as Arc<dyn Resolver>),
            gate,
            events: events.clone(),
            activators: self.activators.unwrap_or_default(),
            cleanup: self
                .cleanup
                .unwrap_or_else(|| Arc::new(NoopCleanup) as Arc<dyn ServiceCleanup>),
            metrics,
        };
        let timeout = Duration::from_millis(self.config.lifecycle.state_change_timeout_ms);
        let controller = Arc::new(LifecycleController::new(collaborators, timeout));

        info!(
            next_id,
            timeout_ms = self.config.lifecycle.state_change_timeout_ms,
            security = self.config.security.enabled,
            "创建模块容器"
        );

        Ok(ModuleContainer {
            coordinator: UpdateUninstallCoordinator::new(controller.clone()),
            controller,
            events,
            ids: IdAllocator::starting_at(next_id),
            install_gate: tokio::sync::Mutex::new(()),
            retired: Mutex::new(HashMap::new()),
            config: self.config,
        })
    }
}

/// 模块容器
pub struct ModuleContainer {
    config: ContainerConfig,
    controller: Arc<LifecycleController>,
    coordinator: UpdateUninstallCoordinator,
    events: Arc<EventDispatcher>,
    ids: IdAllocator,
    /// 串行化安装，保证位置唯一
    install_gate: tokio::sync::Mutex<()>,
    /// 已卸载模块的弱引用，持有句柄的调用方仍能按 ID 查询
    retired: Mutex<HashMap<ModuleId, Weak<Module>>>,
}

impl ModuleContainer {
    /// 使用默认协作者创建容器
    pub async fn new(config: ContainerConfig, activators: Arc<ActivatorRegistry>) -> Result<Self> {
        Self::builder(config).activators(activators).build().await
    }

    pub fn builder(config: ContainerConfig) -> ModuleContainerBuilder {
        ModuleContainerBuilder::new(config)
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn registry(&self) -> &Arc<DependencyRegistry> {
        self.controller.registry()
    }

    fn storage(&self) -> &Arc<dyn ModuleStorage> {
        self.controller.storage()
    }

    /// 查找模块，包括已卸载的
    async fn lookup(&self, module_id: ModuleId) -> Result<Arc<Module>> {
        if let Some(module) = self.registry().get(module_id).await {
            return Ok(module);
        }
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&module_id)
            .and_then(Weak::upgrade)
            .ok_or(CoreError::ModuleNotFound(module_id))
    }

    // ==================== 安装 ====================

    /// 从目录安装模块，位置为目录路径
    pub async fn install_dir(&self, dir: impl AsRef<Path>) -> Result<Arc<Module>> {
        let dir = dir.as_ref();
        self.install(
            &dir.display().to_string(),
            ModuleSource::Directory(dir.to_path_buf()),
        )
        .await
    }

    /// 安装模块
    ///
    /// 同一位置已经安装过时直接返回已有模块。
    ///
    /// # Errors
    ///
    /// - 内容无效 (`InvalidMetadata`)
    /// - 符号名和版本与已安装模块冲突 (`ModuleConflict`)
    /// - 存储事务失败 (`StorageFailed`)
    #[instrument(skip(self, source))]
    pub async fn install(&self, location: &str, source: ModuleSource) -> Result<Arc<Module>> {
        with_owner(async {
            self.controller.gate().check_admin("install")?;
            let _install = self.install_gate.lock().await;

            if let Some(existing) = self.registry().find_by_location(location).await {
                debug!(module_id = existing.id(), "位置已安装，返回已有模块");
                return Ok(existing);
            }

            let module_id = self.ids.allocate();
            self.storage().save_next_id(self.ids.peek()).await?;

            let start_level = self.config.lifecycle.default_start_level;
            let mut operation = self
                .storage()
                .install_module(module_id, location, source, start_level);
            let staged = match operation.begin().await {
                Ok(staged) => staged,
                Err(e) => {
                    if let Err(undo) = operation.undo().await {
                        warn!(module_id, error = %undo, "撤销安装事务失败");
                    }
                    return Err(e);
                }
            };

            let module = Arc::new(Module::new(
                module_id,
                location,
                staged.revision,
                PersistentFlags::empty(),
                start_level,
            ));

            {
                let mut region = self.registry().exclusive().await;
                if let Some(ref name) = module.symbolic_name() {
                    let version = module.version();
                    if let Some(existing) = region.find_by_name_version(name, &version, None) {
                        drop(region);
                        if let Err(undo) = operation.undo().await {
                            warn!(module_id, error = %undo, "撤销安装事务失败");
                        }
                        return Err(CoreError::ModuleConflict {
                            symbolic_name: name.clone(),
                            version: version.to_string(),
                            existing_id: existing.id(),
                        });
                    }
                }
                region.add(module.clone());
            }

            if let Err(e) = operation.commit(false).await {
                self.registry().exclusive().await.remove(module_id);
                if let Err(undo) = operation.undo().await {
                    warn!(module_id, error = %undo, "撤销安装事务失败");
                }
                return Err(e);
            }

            info!(
                module_id,
                location,
                symbolic_name = %module.symbolic_name().unwrap_or_default(),
                version = %module.version(),
                "模块已安装"
            );
            self.events
                .publish_lifecycle_event(LifecycleEventKind::Installed, &module);
            Ok(module)
        })
        .await
    }

    // ==================== 生命周期 ====================

    /// 启动模块，`persistent` 为 true 时下次 launch 自动启动
    #[instrument(skip(self))]
    pub async fn start(&self, module_id: ModuleId, persistent: bool) -> Result<()> {
        with_owner(async {
            let module = self.lookup(module_id).await?;
            self.controller.start(&module, persistent).await
        })
        .await
    }

    /// 停止模块，`persistent` 为 true 时清除自动启动标志
    #[instrument(skip(self))]
    pub async fn stop(&self, module_id: ModuleId, persistent: bool) -> Result<()> {
        with_owner(async {
            let module = self.lookup(module_id).await?;
            self.controller.stop(&module, persistent).await
        })
        .await
    }

    /// 更新模块内容，模块 ID 不变
    #[instrument(skip(self, source))]
    pub async fn update(&self, module_id: ModuleId, source: ModuleSource) -> Result<()> {
        with_owner(async {
            let module = self.lookup(module_id).await?;
            self.coordinator.update(&module, source).await
        })
        .await
    }

    /// 从原位置目录重新读取内容并更新
    pub async fn update_from_location(&self, module_id: ModuleId) -> Result<()> {
        let module = self.lookup(module_id).await?;
        let dir = std::path::PathBuf::from(module.location());
        self.update(module_id, ModuleSource::Directory(dir)).await
    }

    /// 卸载模块
    #[instrument(skip(self))]
    pub async fn uninstall(&self, module_id: ModuleId) -> Result<()> {
        with_owner(self.uninstall_inner(module_id)).await
    }

    async fn uninstall_inner(&self, module_id: ModuleId) -> Result<()> {
        let module = self.lookup(module_id).await?;
        self.coordinator.uninstall(&module).await?;
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        retired.retain(|_, record| record.strong_count() > 0);
        retired.insert(module_id, Arc::downgrade(&module));
        Ok(())
    }

    /// 解析指定模块，`ids` 为空时解析全部未解析模块
    ///
    /// 返回是否全部解析成功；单个模块的失败只记录日志。
    #[instrument(skip(self))]
    pub async fn resolve(&self, ids: &[ModuleId]) -> Result<bool> {
        with_owner(self.resolve_inner(ids)).await
    }

    async fn resolve_inner(&self, ids: &[ModuleId]) -> Result<bool> {
        let modules: Vec<Arc<Module>> = if ids.is_empty() {
            self.registry()
                .list()
                .await
                .into_iter()
                .filter(|m| m.state() == ModuleState::Installed)
                .collect()
        } else {
            let mut modules = Vec::with_capacity(ids.len());
            for id in ids {
                modules.push(self.lookup(*id).await?);
            }
            modules
        };

        let mut all_resolved = true;
        for module in modules {
            if let Err(e) = self.controller.resolve(&module).await {
                debug!(module_id = module.id(), error = %e, "模块未能解析");
                all_resolved = false;
            }
        }
        Ok(all_resolved)
    }

    /// 刷新因更新或卸载而被标记的模块
    ///
    /// 活动的模块先停止，全部退回 INSTALLED 并断开连线，再按启动顺序重新启动之前活动的模块。
    #[instrument(skip(self))]
    pub async fn refresh_pending(&self) -> Result<BatchReport> {
        with_owner(self.refresh_inner()).await
    }

    async fn refresh_inner(&self) -> Result<BatchReport> {
        let marked = self.registry().exclusive().await.take_marked();
        let mut report = BatchReport::default();
        if marked.is_empty() {
            return Ok(report);
        }
        info!(count = marked.len(), "刷新被标记的模块");

        let mut restart = Vec::new();
        for module in marked.iter().rev() {
            if module.state() == ModuleState::Active {
                match self.controller.suspend(module).await {
                    Ok(()) => restart.push(module.id()),
                    Err(e) => self.events.publish_error_event(module, &e),
                }
            }
        }

        for module in &marked {
            match self.controller.begin_state_change(module).await {
                Ok(_guard) => self.controller.unresolve_locked(module).await,
                Err(e) => self.events.publish_error_event(module, &e),
            }
        }

        // marked 已按启动顺序排列
        for module in &marked {
            if !restart.contains(&module.id()) {
                report.succeeded.push(module.id());
                continue;
            }
            let result = self.controller.resume(module).await;
            if let Err(ref e) = result {
                self.events.publish_error_event(module, e);
            }
            report.record(module.id(), result);
        }
        Ok(report)
    }

    // ==================== 启动级别 ====================

    /// 设置模块启动级别并持久化
    ///
    /// 自动启动的模块随新级别调整：高于活动级别时停止，不高于时启动。
    #[instrument(skip(self))]
    pub async fn set_module_start_level(&self, module_id: ModuleId, level: i32) -> Result<()> {
        if level < 1 {
            return Err(CoreError::InvalidConfigValue {
                key: "start_level".to_string(),
                reason: "启动级别从 1 开始".to_string(),
            });
        }
        with_owner(self.set_start_level_inner(module_id, level)).await
    }

    async fn set_start_level_inner(&self, module_id: ModuleId, level: i32) -> Result<()> {
        self.controller.gate().check_admin("start_level")?;
        let module = self.lookup(module_id).await?;
        {
            let _guard = self.controller.begin_state_change(&module).await?;
            if module.state() == ModuleState::Uninstalled {
                return Err(CoreError::uninstalled(module_id));
            }
            module.set_start_level(level);
            self.storage()
                .save_module_state(module_id, module.flags(), level)
                .await?;
            debug!(module_id, start_level = level, "启动级别已更新");
        }

        if !module.is_auto_start() || module.is_fragment() {
            return Ok(());
        }
        let active_level = self.config.lifecycle.active_start_level;
        let state = module.state();
        if level > active_level && state == ModuleState::Active {
            self.controller.suspend(&module).await
        } else if level <= active_level && state != ModuleState::Active {
            self.controller.resume(&module).await
        } else {
            Ok(())
        }
    }

    /// 按启动级别升序启动全部非片段模块，同一级别内并发启动
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> Result<BatchReport> {
        self.controller.gate().check_admin("start")?;
        let modules = self.startable().await;
        Ok(self.run_by_level(modules, true).await)
    }

    /// 按启动级别降序停止全部非片段模块，同一级别内并发停止
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> Result<BatchReport> {
        self.controller.gate().check_admin("stop")?;
        let mut modules = self.startable().await;
        modules.reverse();
        Ok(self.run_by_level(modules, false).await)
    }

    async fn startable(&self) -> Vec<Arc<Module>> {
        self.registry()
            .list()
            .await
            .into_iter()
            .filter(|m| !m.is_fragment())
            .collect()
    }

    /// `modules` 已按执行顺序排好，相邻的同级模块为一组并发执行
    async fn run_by_level(&self, modules: Vec<Arc<Module>>, start: bool) -> BatchReport {
        let mut report = BatchReport::default();
        let mut index = 0;
        while index < modules.len() {
            let level = modules[index].start_level();
            let group: Vec<_> = modules[index..]
                .iter()
                .take_while(|m| m.start_level() == level)
                .cloned()
                .collect();
            index += group.len();
            debug!(start_level = level, count = group.len(), start, "处理启动级别");

            let results = join_all(group.iter().map(|module| {
                with_new_owner(async move {
                    if start {
                        self.controller.resume(module).await
                    } else {
                        self.controller.suspend(module).await
                    }
                })
            }))
            .await;

            for (module, result) in group.iter().zip(results) {
                if let Err(ref e) = result {
                    self.events.publish_error_event(module, e);
                }
                report.record(module.id(), result);
            }
        }
        report
    }

    /// 从存储加载全部模块，返回新加载的数量
    ///
    /// 已在注册表中的模块跳过，不会启动任何模块。
    #[instrument(skip(self))]
    pub async fn load_persisted(&self) -> Result<usize> {
        let records = self.storage().load_all().await?;
        let mut loaded = 0usize;
        {
            let mut region = self.registry().exclusive().await;
            for record in records {
                self.ids.observe(record.id);
                if region.get(record.id).is_some() {
                    continue;
                }
                let module = Arc::new(Module::new(
                    record.id,
                    record.location.clone(),
                    record.revision(),
                    record.flags,
                    record.start_level,
                ));
                region.add(module);
                loaded += 1;
            }
        }
        self.storage().save_next_id(self.ids.peek()).await?;
        debug!(loaded, "已加载持久化模块");
        Ok(loaded)
    }

    /// 加载持久化模块，并启动标记为自动启动且启动级别不高于活动级别的模块
    #[instrument(skip(self))]
    pub async fn launch(&self) -> Result<BatchReport> {
        let loaded = self.load_persisted().await?;

        let active_level = self.config.lifecycle.active_start_level;
        let auto_start: Vec<_> = self
            .startable()
            .await
            .into_iter()
            .filter(|m| m.is_auto_start() && m.start_level() <= active_level)
            .collect();
        info!(loaded, auto_start = auto_start.len(), active_level, "容器启动");

        Ok(self.run_by_level(auto_start, true).await)
    }

    // ==================== 查询 ====================

    /// 按 ID 获取模块，已卸载的模块也能取到
    pub async fn get_module(&self, module_id: ModuleId) -> Option<Arc<Module>> {
        self.lookup(module_id).await.ok()
    }

    /// 按符号名和版本查找已安装模块
    pub async fn find_module(&self, symbolic_name: &str, version: &str) -> Option<Arc<Module>> {
        let version = semver::Version::parse(version).ok()?;
        self.registry()
            .find_by_name_version(symbolic_name, &version)
            .await
    }

    pub async fn find_by_location(&self, location: &str) -> Option<Arc<Module>> {
        self.registry().find_by_location(location).await
    }

    /// 按启动顺序列出已安装模块
    pub async fn list_modules(&self) -> Vec<ModuleInfo> {
        self.registry()
            .list()
            .await
            .iter()
            .map(|m| m.info())
            .collect()
    }

    /// 模块当前状态，不需要状态变更锁
    pub async fn module_state(&self, module_id: ModuleId) -> Option<ModuleState> {
        self.get_module(module_id).await.map(|m| m.state())
    }

    /// 最近一次解析权限检查失败的诊断信息
    pub async fn last_permission_failure(&self, module_id: ModuleId) -> Option<String> {
        self.get_module(module_id)
            .await
            .and_then(|m| m.last_permission_failure())
    }

    /// 等待刷新的模块
    pub async fn pending_refresh(&self) -> Vec<ModuleId> {
        self.registry().exclusive().await.marked()
    }

    pub async fn module_count(&self) -> usize {
        self.registry().len().await
    }

    // ==================== 事件与指标 ====================

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn subscribe_pattern(&self, pattern: impl Into<String>) -> EventSubscription {
        self.events.subscribe_pattern(pattern)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.controller.metrics().snapshot()
    }
}
