//! 生命周期控制器
//!
//! 每个模块的六状态状态机：
//!
//! ```text
//! INSTALLED --resolve--> RESOLVED --start--> STARTING --> ACTIVE
//!                           ^                                |
//!                           +--------- STOPPING <---stop-----+
//! 任意状态 --uninstall--> UNINSTALLED（终态）
//! ```
//!
//! 所有转换都在持有模块状态变更锁时进行。片段没有独立的活动状态，
//! 对片段的启动和停止重定向到它的宿主。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::module::activator::{ActivatorRegistry, ModuleActivator, ModuleContext, ServiceCleanup};
use crate::module::dependency::Resolver;
use crate::module::events::{EventSink, LifecycleEventKind};
use crate::module::metadata::{ModuleState, PersistentFlags};
use crate::module::record::{Module, TransitionTarget};
use crate::module::registry::{DependencyRegistry, RegistryState};
use crate::module::security::{check_permissions, PrivilegeGate};
use crate::module::storage::ModuleStorage;
use crate::module::transition::TransitionGuard;
use crate::utils::{CoreError, LifecycleMetrics, ModuleId, Result};

/// 控制器依赖的外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<DependencyRegistry>,
    pub storage: Arc<dyn ModuleStorage>,
    pub resolver: Arc<dyn Resolver>,
    pub gate: Arc<dyn PrivilegeGate>,
    pub events: Arc<dyn EventSink>,
    pub activators: Arc<ActivatorRegistry>,
    pub cleanup: Arc<dyn ServiceCleanup>,
    pub metrics: Arc<LifecycleMetrics>,
}

/// 生命周期控制器
pub struct LifecycleController {
    collaborators: Collaborators,
    timeout: Duration,
    /// 运行中模块的激活器实例，停止时取出
    running: Mutex<HashMap<ModuleId, Arc<dyn ModuleActivator>>>,
}

impl LifecycleController {
    /// 创建控制器
    ///
    /// # Arguments
    ///
    /// * `collaborators` - 注册表、存储、解析器、权限、事件等协作者
    /// * `timeout` - 状态变更锁的等待上限
    pub fn new(collaborators: Collaborators, timeout: Duration) -> Self {
        debug!(timeout_ms = timeout.as_millis() as u64, "创建生命周期控制器");
        Self {
            collaborators,
            timeout,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<DependencyRegistry> {
        &self.collaborators.registry
    }

    pub fn storage(&self) -> &Arc<dyn ModuleStorage> {
        &self.collaborators.storage
    }

    pub fn gate(&self) -> &Arc<dyn PrivilegeGate> {
        &self.collaborators.gate
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.collaborators.events
    }

    pub fn metrics(&self) -> &Arc<LifecycleMetrics> {
        &self.collaborators.metrics
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // ==================== 状态变更锁 ====================

    /// 占有模块的状态变更锁（beginStateChange），守卫释放即 completeStateChange
    pub async fn begin_state_change<'a>(&self, module: &'a Module) -> Result<TransitionGuard<'a>> {
        match module
            .transition_lock()
            .acquire(module.id(), self.timeout)
            .await
        {
            Ok(guard) => {
                if !guard.waited().is_zero() {
                    let waited_us = guard.waited().as_micros() as u64;
                    self.metrics().record_lock_wait(waited_us);
                    debug!(module_id = module.id(), waited_us, "等待后占有状态变更锁");
                }
                Ok(guard)
            }
            Err(e) => {
                if e.is_lock_timeout() {
                    self.metrics().record_lock_timeout();
                    warn!(module_id = module.id(), error = %e, "状态变更锁等待超时");
                }
                Err(e)
            }
        }
    }

    /// 持有锁时仍看到 STARTING / STOPPING：上一次转换没有正常结束
    fn unsettled(&self, module: &Module) -> CoreError {
        self.metrics().record_lock_timeout();
        warn!(module_id = module.id(), state = %module.state(), "模块停留在中间状态");
        CoreError::StateChangeTimeout {
            module_id: module.id(),
            waited_ms: 0,
        }
    }

    // ==================== 启动 ====================

    /// 启动模块
    ///
    /// `persistent` 为 true 时记录自动启动标志，下次 launch 时自动启动。
    ///
    /// # Errors
    ///
    /// - 模块已卸载或重入时返回 `IllegalState` / `ReentrantStateChange`
    /// - 等待状态变更锁超时返回 `StateChangeTimeout`
    /// - 无法解析返回 `ResolutionFailed`，模块保持 INSTALLED
    /// - 激活器失败返回 `ActivationFailed`，模块回到 RESOLVED
    pub async fn start(&self, module: &Arc<Module>, persistent: bool) -> Result<()> {
        self.gate().check_admin("start")?;
        self.start_with(module, persistent, false).await
    }

    /// 非持久启动，对已卸载模块为空操作
    pub async fn resume(&self, module: &Arc<Module>) -> Result<()> {
        self.start_with(module, false, true).await
    }

    async fn start_with(
        &self,
        module: &Arc<Module>,
        persistent: bool,
        tolerate_uninstalled: bool,
    ) -> Result<()> {
        if tolerate_uninstalled && module.state() == ModuleState::Uninstalled {
            return Ok(());
        }
        let _guard = self.begin_state_change(module).await?;
        if module.state() == ModuleState::Uninstalled {
            return if tolerate_uninstalled {
                Ok(())
            } else {
                Err(CoreError::uninstalled(module.id()))
            };
        }

        if !module.is_fragment() {
            return self.start_locked(module, persistent).await;
        }

        if module.state() == ModuleState::Installed {
            if let Err(e) = self.resolve_locked(module).await {
                debug!(module_id = module.id(), error = %e, "片段无法解析，视为未附着");
            }
        }
        match module.transition_target() {
            TransitionTarget::Host(host) => {
                debug!(module_id = module.id(), host_id = host.id(), "片段启动重定向到宿主");
                let _host_guard = self.begin_state_change(&host).await?;
                self.start_locked(&host, persistent).await
            }
            TransitionTarget::Detached | TransitionTarget::Itself => {
                debug!(module_id = module.id(), "片段未附着到宿主，启动为空操作");
                Ok(())
            }
        }
    }

    /// 在已持有锁的情况下启动模块
    pub(crate) async fn start_locked(&self, module: &Arc<Module>, persistent: bool) -> Result<()> {
        let module_id = module.id();
        match module.state() {
            ModuleState::Uninstalled => return Err(CoreError::uninstalled(module_id)),
            ModuleState::Active | ModuleState::Starting => {
                if persistent {
                    self.persist_auto_start(module, true).await;
                }
                return Ok(());
            }
            ModuleState::Stopping => return Err(self.unsettled(module)),
            ModuleState::Installed => self.resolve_locked(module).await?,
            ModuleState::Resolved => {}
        }

        module.set_state(ModuleState::Starting);
        debug!(module_id, "模块启动中");

        let context = ModuleContext::new(module.clone());
        let outcome = match self.instantiate_activator(module) {
            Ok(Some(activator)) => activator
                .start(&context)
                .await
                .map(|()| Some(activator)),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };

        let activator = match outcome {
            Ok(activator) => activator,
            Err(cause) => {
                module.set_state(ModuleState::Resolved);
                self.collaborators.cleanup.release_module(module);
                self.metrics().record_activator_failure();
                warn!(module_id, error = %cause, "激活器启动失败，模块回到 RESOLVED");
                return Err(CoreError::ActivationFailed {
                    module_id,
                    source: cause.into(),
                });
            }
        };

        if persistent {
            self.persist_auto_start(module, true).await;
        }
        if let Some(activator) = activator {
            self.running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(module_id, activator);
        }
        module.set_state(ModuleState::Active);
        self.metrics().record_start();
        info!(module_id, location = %module.location(), "模块已启动");
        self.events()
            .publish_lifecycle_event(LifecycleEventKind::Started, module);
        Ok(())
    }

    fn instantiate_activator(
        &self,
        module: &Module,
    ) -> anyhow::Result<Option<Arc<dyn ModuleActivator>>> {
        let Some(name) = module.revision().descriptor.activator.clone() else {
            return Ok(None);
        };
        self.collaborators
            .activators
            .create(&name)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("激活器未注册: {}", name))
    }

    // ==================== 停止 ====================

    /// 停止模块
    ///
    /// `persistent` 为 true 时在调用激活器之前清除自动启动标志。
    /// 激活器的错误不会中断清理，模块总会到达 RESOLVED，错误在清理后返回。
    pub async fn stop(&self, module: &Arc<Module>, persistent: bool) -> Result<()> {
        self.gate().check_admin("stop")?;
        self.stop_with(module, persistent, false).await
    }

    /// 非持久停止，对已卸载模块为空操作
    pub async fn suspend(&self, module: &Arc<Module>) -> Result<()> {
        self.stop_with(module, false, true).await
    }

    async fn stop_with(
        &self,
        module: &Arc<Module>,
        persistent: bool,
        tolerate_uninstalled: bool,
    ) -> Result<()> {
        if tolerate_uninstalled && module.state() == ModuleState::Uninstalled {
            return Ok(());
        }
        let _guard = self.begin_state_change(module).await?;
        if module.state() == ModuleState::Uninstalled {
            return if tolerate_uninstalled {
                Ok(())
            } else {
                Err(CoreError::uninstalled(module.id()))
            };
        }

        match module.transition_target() {
            TransitionTarget::Itself => self.stop_locked(module, persistent).await,
            TransitionTarget::Host(host) => {
                debug!(module_id = module.id(), host_id = host.id(), "片段停止重定向到宿主");
                let _host_guard = self.begin_state_change(&host).await?;
                self.stop_locked(&host, persistent).await
            }
            TransitionTarget::Detached => {
                debug!(module_id = module.id(), "片段未附着到宿主，停止为空操作");
                Ok(())
            }
        }
    }

    /// 在已持有锁的情况下停止模块
    pub(crate) async fn stop_locked(&self, module: &Arc<Module>, persistent: bool) -> Result<()> {
        let module_id = module.id();
        match module.state() {
            ModuleState::Uninstalled => return Err(CoreError::uninstalled(module_id)),
            ModuleState::Stopping | ModuleState::Resolved | ModuleState::Installed => {
                if persistent {
                    self.persist_auto_start(module, false).await;
                }
                return Ok(());
            }
            ModuleState::Starting => return Err(self.unsettled(module)),
            ModuleState::Active => {}
        }

        module.set_state(ModuleState::Stopping);
        debug!(module_id, "模块停止中");
        if persistent {
            self.persist_auto_start(module, false).await;
        }

        let activator = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&module_id);
        let outcome = match activator {
            Some(activator) => activator.stop(&ModuleContext::new(module.clone())).await,
            None => Ok(()),
        };

        // 清理总会执行，激活器错误留到最后返回
        self.collaborators.cleanup.release_module(module);
        module.set_state(ModuleState::Resolved);
        self.metrics().record_stop();
        info!(module_id, location = %module.location(), "模块已停止");
        self.events()
            .publish_lifecycle_event(LifecycleEventKind::Stopped, module);

        outcome.map_err(|cause| {
            self.metrics().record_activator_failure();
            warn!(module_id, error = %cause, "激活器停止失败，清理已完成");
            CoreError::ActivationFailed {
                module_id,
                source: cause.into(),
            }
        })
    }

    /// 写入自动启动标志；写入失败只发布错误事件
    async fn persist_auto_start(&self, module: &Module, auto_start: bool) {
        let mut flags = module.flags();
        if flags.contains(PersistentFlags::AUTO_START) == auto_start {
            return;
        }
        if auto_start {
            flags.insert(PersistentFlags::AUTO_START);
        } else {
            flags.remove(PersistentFlags::AUTO_START);
        }
        module.set_flags(flags);
        if let Err(e) = self
            .storage()
            .save_module_state(module.id(), flags, module.start_level())
            .await
        {
            warn!(module_id = module.id(), error = %e, "保存自动启动标志失败");
            self.events().publish_error_event(module, &e);
        }
    }

    // ==================== 解析 ====================

    /// 解析模块（INSTALLED -> RESOLVED）
    ///
    /// 已解析的模块直接返回 `Ok(())`。
    pub async fn resolve(&self, module: &Arc<Module>) -> Result<()> {
        let _guard = self.begin_state_change(module).await?;
        if module.state() == ModuleState::Uninstalled {
            return Err(CoreError::uninstalled(module.id()));
        }
        self.resolve_locked(module).await
    }

    /// 在已持有锁的情况下解析模块
    ///
    /// 非片段模块解析成功后，尝试把尚未附着的片段一并解析并附着；
    /// 片段的锁只做非阻塞尝试，已被占用的片段跳过。
    pub(crate) async fn resolve_locked(&self, module: &Arc<Module>) -> Result<()> {
        if module.state() != ModuleState::Installed {
            return Ok(());
        }

        let mut resolved = Vec::new();
        {
            let mut region = self.registry().exclusive().await;
            self.resolve_in_region(&mut region, module)?;
            resolved.push(module.clone());

            if !module.is_fragment() {
                for fragment in region.fragments_of(module) {
                    if fragment.state() != ModuleState::Installed {
                        continue;
                    }
                    let Some(_fragment_guard) = fragment.transition_lock().try_acquire() else {
                        continue;
                    };
                    match self.resolve_in_region(&mut region, &fragment) {
                        Ok(()) => resolved.push(fragment.clone()),
                        Err(e) => {
                            debug!(module_id = fragment.id(), error = %e, "片段暂时无法附着")
                        }
                    }
                }
            }
        }

        for module in &resolved {
            self.events()
                .publish_lifecycle_event(LifecycleEventKind::Resolved, module);
        }
        Ok(())
    }

    fn resolve_in_region(&self, region: &mut RegistryState, module: &Arc<Module>) -> Result<()> {
        let module_id = module.id();
        let resolution = self
            .collaborators
            .resolver
            .resolve(module, region.modules())
            .map_err(|reason| {
                debug!(module_id, reason = %reason, "模块无法解析");
                CoreError::ResolutionFailed {
                    module_id,
                    reason,
                }
            })?;

        // 没有权限绑定的模块总是放行
        if module.permission_binding().is_some() {
            if let Err(failure) =
                check_permissions(module, &resolution, region.modules(), self.gate().as_ref())
            {
                warn!(module_id, reason = %failure, "解析权限检查失败");
                module.set_permission_failure(Some(failure.clone()));
                return Err(CoreError::ResolutionFailed {
                    module_id,
                    reason: failure,
                });
            }
        }
        module.set_permission_failure(None);

        for wire in &resolution.wires {
            region.graph_mut().add_wire(module_id, wire.provider);
        }
        if let Some(host) = resolution.host().and_then(|id| region.get(id)) {
            module.attach_host(&host);
        }
        module.set_state(ModuleState::Resolved);
        debug!(module_id, wires = resolution.wires.len(), "模块已解析");
        Ok(())
    }

    /// 把已解析的模块退回 INSTALLED 并断开它的连线（刷新用）
    pub(crate) async fn unresolve_locked(&self, module: &Module) {
        if !module.state().is_resolved() {
            return;
        }
        self.registry().exclusive().await.graph_mut().unwire(module.id());
        module.detach_host();
        module.set_state(ModuleState::Installed);
        debug!(module_id = module.id(), "模块退回 INSTALLED");
        self.events()
            .publish_lifecycle_event(LifecycleEventKind::Unresolved, module);
    }

    /// 丢弃模块的激活器实例（卸载后）
    pub(crate) fn forget(&self, module_id: ModuleId) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&module_id);
    }
}
