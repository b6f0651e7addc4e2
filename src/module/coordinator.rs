//! 更新与卸载协调器
//!
//! 更新和卸载是跨越持久化存储和依赖注册表的补偿事务。每一步成功后把它的
//! 逆操作压入 [`Transaction`]，任何一步失败都按相反顺序执行逆操作。
//!
//! 更新：
//! 1. 占有状态变更锁
//! 2. 模块（片段则为宿主）处于 ACTIVE 时先非持久停止
//! 3. 开始存储事务，得到暂存记录
//! 4. 在注册表独占区内检查符号名和版本唯一性，标记依赖方，替换修订
//! 5. 提交存储事务
//! 6. 失败时撤销存储事务并换回旧修订
//! 7. 无论成败，之前停止过的模块重新启动
//!
//! 卸载结构相同，第 4 步改为从注册表移除，失败时重新加入。
//! 回滚和重启本身的失败只通过错误事件上报，不改变调用方看到的结果。

use std::sync::Arc;

use tracing::{debug, info, warn, Instrument};

use crate::module::events::LifecycleEventKind;
use crate::module::lifecycle::LifecycleController;
use crate::module::metadata::ModuleState;
use crate::module::record::{Module, ModuleRevision, TransitionTarget};
use crate::module::registry::{RemoveOutcome, SwapOutcome};
use crate::module::storage::{ModuleSource, StorageOperation};
use crate::utils::{CoreError, Result};
use crate::{log_contained_failure, transition_span};

/// 已完成步骤的逆操作
enum Compensation {
    /// 修订已替换
    Swapped {
        outcome: SwapOutcome,
        prior_state: ModuleState,
        prior_host: Option<Arc<Module>>,
    },
    /// 已从注册表移除
    Removed { outcome: RemoveOutcome },
}

/// 进行中的补偿事务
struct Transaction {
    operation: Box<dyn StorageOperation>,
    compensations: Vec<Compensation>,
}

impl Transaction {
    fn new(operation: Box<dyn StorageOperation>) -> Self {
        Self {
            operation,
            compensations: Vec::new(),
        }
    }

    /// 按相反顺序执行全部逆操作，返回是否全部成功
    async fn rollback(mut self, controller: &LifecycleController, module: &Arc<Module>) -> bool {
        let mut clean = true;

        if let Err(e) = self.operation.undo().await {
            clean = false;
            log_contained_failure!(module.id(), "undo", e);
            controller.events().publish_error_event(module, &e);
        }

        while let Some(step) = self.compensations.pop() {
            let mut region = controller.registry().exclusive().await;
            match step {
                Compensation::Swapped {
                    outcome,
                    prior_state,
                    prior_host,
                } => {
                    region.revert_swap(module, outcome);
                    module.set_state(prior_state);
                    if let Some(host) = prior_host {
                        module.attach_host(&host);
                    }
                    debug!(module_id = module.id(), "已换回旧修订");
                }
                Compensation::Removed { outcome } => {
                    if region.get(module.id()).is_some() {
                        let e = CoreError::Internal(format!(
                            "模块 {} 已在注册表中，无法重新加入",
                            module.id()
                        ));
                        clean = false;
                        log_contained_failure!(module.id(), "readd", e);
                        controller.events().publish_error_event(module, &e);
                        continue;
                    }
                    region.readd(module.clone(), &outcome);
                    debug!(module_id = module.id(), "已重新加入注册表");
                }
            }
        }

        controller.metrics().record_rollback(clean);
        clean
    }
}

/// 更新与卸载协调器
pub struct UpdateUninstallCoordinator {
    controller: Arc<LifecycleController>,
}

impl UpdateUninstallCoordinator {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// 停止和重启的实际目标：普通模块为自身，片段为宿主
    fn bracket_target(module: &Arc<Module>) -> Option<Arc<Module>> {
        match module.transition_target() {
            TransitionTarget::Itself => Some(module.clone()),
            TransitionTarget::Host(host) => Some(host),
            TransitionTarget::Detached => None,
        }
    }

    async fn stop_target(&self, module: &Arc<Module>, target: &Arc<Module>) -> Result<()> {
        if Arc::ptr_eq(module, target) {
            self.controller.stop_locked(target, false).await
        } else {
            let _host_guard = self.controller.begin_state_change(target).await?;
            self.controller.stop_locked(target, false).await
        }
    }

    async fn start_target(&self, module: &Arc<Module>, target: &Arc<Module>) -> Result<()> {
        if Arc::ptr_eq(module, target) {
            self.controller.start_locked(target, false).await
        } else {
            let _host_guard = self.controller.begin_state_change(target).await?;
            self.controller.start_locked(target, false).await
        }
    }

    /// 重启之前停止的模块，失败只上报
    async fn restart(&self, module: &Arc<Module>, target: &Arc<Module>, operation: &str) {
        if let Err(e) = self.start_target(module, target).await {
            log_contained_failure!(target.id(), operation, e);
            self.controller.events().publish_error_event(module, &e);
        }
    }

    // ==================== 更新 ====================

    /// 用新内容更新模块，模块 ID 不变
    ///
    /// # Errors
    ///
    /// - 模块已卸载、重入或锁超时
    /// - 活动模块无法停止
    /// - 存储事务失败 (`StorageFailed`)、新内容无效 (`InvalidMetadata`)
    /// - 新内容的符号名和版本与其他模块冲突 (`ModuleConflict`)
    ///
    /// 失败时模块内容和状态与调用前一致。
    pub async fn update(&self, module: &Arc<Module>, source: ModuleSource) -> Result<()> {
        self.controller.gate().check_admin("update")?;
        self.update_inner(module, source)
            .instrument(transition_span!("update", module.id()))
            .await
    }

    async fn update_inner(&self, module: &Arc<Module>, source: ModuleSource) -> Result<()> {
        let _guard = self.controller.begin_state_change(module).await?;
        if module.state() == ModuleState::Uninstalled {
            return Err(CoreError::uninstalled(module.id()));
        }

        let target = Self::bracket_target(module);
        let stopped = match target {
            Some(ref target) if target.state() == ModuleState::Active => {
                if let Err(e) = self.stop_target(module, target).await {
                    self.controller.events().publish_error_event(module, &e);
                    if target.state() == ModuleState::Active {
                        warn!(module_id = module.id(), error = %e, "活动模块无法停止，放弃更新");
                        return Err(e);
                    }
                }
                Some(target.clone())
            }
            _ => None,
        };

        let result = self.apply_update(module, source).await;
        if result.is_ok() {
            self.controller.metrics().record_update();
            info!(module_id = module.id(), version = %module.version(), "模块已更新");
            self.controller
                .events()
                .publish_lifecycle_event(LifecycleEventKind::Updated, module);
        }

        if let Some(ref target) = stopped {
            self.restart(module, target, "update").await;
        }
        result
    }

    async fn apply_update(&self, module: &Arc<Module>, source: ModuleSource) -> Result<()> {
        let module_id = module.id();
        let mut transaction =
            Transaction::new(self.controller.storage().update_module(module_id, source));

        let staged = match transaction.operation.begin().await {
            Ok(staged) => staged,
            Err(e) => {
                transaction.rollback(&self.controller, module).await;
                return Err(e);
            }
        };
        let revision = Arc::new(staged.revision);

        {
            let mut region = self.controller.registry().exclusive().await;

            if let Some(ref name) = revision.descriptor.symbolic_name {
                let version = revision.descriptor.parsed_version();
                if let Some(existing) = region.find_by_name_version(name, &version, Some(module_id))
                {
                    drop(region);
                    let err = CoreError::ModuleConflict {
                        symbolic_name: name.clone(),
                        version: version.to_string(),
                        existing_id: existing.id(),
                    };
                    warn!(module_id, error = %err, "更新内容与已安装模块冲突");
                    transaction.rollback(&self.controller, module).await;
                    return Err(err);
                }
            }

            region.mark_dependents(module_id);
            let prior_state = module.state();
            let prior_host = module.host();
            let outcome = region.swap(module, revision);
            // 新修订需要重新解析
            module.detach_host();
            if prior_state.is_resolved() {
                module.set_state(ModuleState::Installed);
            }
            transaction.compensations.push(Compensation::Swapped {
                outcome,
                prior_state,
                prior_host,
            });
        }

        let in_use = match transaction.compensations.last() {
            Some(Compensation::Swapped { outcome, .. }) => outcome.in_use,
            _ => false,
        };
        if let Err(e) = transaction.operation.commit(in_use).await {
            warn!(module_id, error = %e, "提交更新失败，开始回滚");
            transaction.rollback(&self.controller, module).await;
            return Err(e);
        }
        debug!(module_id, in_use, "更新已提交");
        Ok(())
    }

    // ==================== 卸载 ====================

    /// 卸载模块
    ///
    /// 活动模块先非持久停止，停止失败只上报，不阻止卸载。
    /// 成功后模块进入 UNINSTALLED，此后任何操作都以 `IllegalState` 失败；
    /// 失败时模块重新加入注册表并在之前活动时重新启动。
    pub async fn uninstall(&self, module: &Arc<Module>) -> Result<()> {
        self.controller.gate().check_admin("uninstall")?;
        self.uninstall_inner(module)
            .instrument(transition_span!("uninstall", module.id()))
            .await
    }

    async fn uninstall_inner(&self, module: &Arc<Module>) -> Result<()> {
        let _guard = self.controller.begin_state_change(module).await?;
        if module.state() == ModuleState::Uninstalled {
            return Err(CoreError::uninstalled(module.id()));
        }

        let target = Self::bracket_target(module);
        let stopped = match target {
            Some(ref target) if target.state() == ModuleState::Active => {
                if let Err(e) = self.stop_target(module, target).await {
                    self.controller.events().publish_error_event(module, &e);
                }
                Some(target.clone())
            }
            _ => None,
        };

        if let Err(e) = self.apply_uninstall(module).await {
            if let Some(ref target) = stopped {
                self.restart(module, target, "uninstall").await;
            }
            return Err(e);
        }

        // 片段卸载后宿主照常运行
        if let Some(ref host) = stopped.filter(|target| !Arc::ptr_eq(target, module)) {
            self.restart(module, host, "uninstall").await;
        }

        self.controller.metrics().record_uninstall();
        info!(module_id = module.id(), location = %module.location(), "模块已卸载");
        self.controller
            .events()
            .publish_lifecycle_event(LifecycleEventKind::Uninstalled, module);
        Ok(())
    }

    async fn apply_uninstall(&self, module: &Arc<Module>) -> Result<()> {
        let module_id = module.id();
        let mut transaction =
            Transaction::new(self.controller.storage().uninstall_module(module_id));

        if let Err(e) = transaction.operation.begin().await {
            transaction.rollback(&self.controller, module).await;
            return Err(e);
        }

        let removed = {
            let mut region = self.controller.registry().exclusive().await;
            region.mark_dependents(module_id);
            region.remove(module_id)
        };
        let Some(outcome) = removed else {
            transaction.rollback(&self.controller, module).await;
            return Err(CoreError::ModuleNotFound(module_id));
        };
        let in_use = outcome.in_use;
        transaction
            .compensations
            .push(Compensation::Removed { outcome });

        if let Err(e) = transaction.operation.commit(in_use).await {
            warn!(module_id, error = %e, "提交卸载失败，开始回滚");
            transaction.rollback(&self.controller, module).await;
            return Err(e);
        }

        module.set_state(ModuleState::Uninstalled);
        module.detach_host();
        self.controller.forget(module_id);
        debug!(module_id, in_use, "卸载已提交");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::activator::{ActivatorRegistry, NoopCleanup};
    use crate::module::dependency::GraphResolver;
    use crate::module::events::EventDispatcher;
    use crate::module::lifecycle::Collaborators;
    use crate::module::metadata::{ModuleDescriptor, PersistentFlags};
    use crate::module::registry::DependencyRegistry;
    use crate::module::security::Unrestricted;
    use crate::module::storage::{MemoryStorage, ModuleStorage};
    use crate::utils::LifecycleMetrics;
    use std::time::Duration;

    struct Fixture {
        coordinator: UpdateUninstallCoordinator,
        storage: MemoryStorage,
        events: Arc<EventDispatcher>,
    }

    fn fixture() -> Fixture {
        let storage = MemoryStorage::new();
        let events = Arc::new(EventDispatcher::new());
        let controller = LifecycleController::new(
            Collaborators {
                registry: Arc::new(DependencyRegistry::new()),
                storage: Arc::new(storage.clone()),
                resolver: Arc::new(GraphResolver::new()),
                gate: Arc::new(Unrestricted),
                events: events.clone(),
                activators: Arc::new(ActivatorRegistry::new()),
                cleanup: Arc::new(NoopCleanup),
                metrics: Arc::new(LifecycleMetrics::new()),
            },
            Duration::from_millis(5000),
        );
        Fixture {
            coordinator: UpdateUninstallCoordinator::new(Arc::new(controller)),
            storage,
            events,
        }
    }

    async fn install(f: &Fixture, id: u64, descriptor: ModuleDescriptor) -> Arc<Module> {
        let mut op = f.storage.install_module(
            id,
            &format!("mem:{}", id),
            ModuleSource::Descriptor(descriptor),
            1,
        );
        let staged = op.begin().await.unwrap();
        op.commit(false).await.unwrap();
        let module = Arc::new(Module::new(
            id,
            staged.location,
            staged.revision,
            PersistentFlags::empty(),
            1,
        ));
        f.coordinator
            .controller()
            .registry()
            .exclusive()
            .await
            .add(module.clone());
        module
    }

    fn source(name: &str, version: &str) -> ModuleSource {
        ModuleSource::Descriptor(ModuleDescriptor::new(name, version))
    }

    fn kinds(f: &mut crate::module::events::EventSubscription) -> Vec<LifecycleEventKind> {
        f.drain()
            .iter()
            .filter_map(|e| e.lifecycle_kind())
            .filter(|k| *k != LifecycleEventKind::Resolved)
            .collect()
    }

    #[tokio::test]
    async fn test_update_active_module_brackets_with_stop_and_start() {
        let f = fixture();
        let m = install(&f, 1, ModuleDescriptor::new("clock", "1.0.0")).await;
        f.coordinator.controller().start(&m, false).await.unwrap();

        let mut sub = f.events.subscribe();
        f.coordinator.update(&m, source("clock", "1.1.0")).await.unwrap();

        assert_eq!(m.id(), 1);
        assert_eq!(m.revision().descriptor.version, "1.1.0");
        assert_eq!(m.revision().generation, 1);
        assert_eq!(m.state(), ModuleState::Active);
        assert_eq!(
            kinds(&mut sub),
            vec![
                LifecycleEventKind::Stopped,
                LifecycleEventKind::Updated,
                LifecycleEventKind::Started
            ]
        );
        assert_eq!(f.storage.record(1).unwrap().descriptor.version, "1.1.0");
    }

    #[tokio::test]
    async fn test_update_inactive_module_becomes_installed() {
        let f = fixture();
        let m = install(&f, 1, ModuleDescriptor::new("clock", "1.0.0")).await;
        f.coordinator.controller().resolve(&m).await.unwrap();

        f.coordinator.update(&m, source("clock", "2.0.0")).await.unwrap();
        assert_eq!(m.state(), ModuleState::Installed);
    }

    #[tokio::test]
    async fn test_conflicting_update_restores_original() {
        let f = fixture();
        let m = install(&f, 1, ModuleDescriptor::new("clock", "1.0.0")).await;
        install(&f, 2, ModuleDescriptor::new("clock", "2.0.0")).await;
        f.coordinator.controller().start(&m, false).await.unwrap();

        let mut sub = f.events.subscribe();
        let err = f
            .coordinator
            .update(&m, source("clock", "2.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ModuleConflict { existing_id: 2, .. }));
        assert_eq!(m.revision().descriptor.version, "1.0.0");
        assert_eq!(m.state(), ModuleState::Active);
        assert_eq!(
            kinds(&mut sub),
            vec![LifecycleEventKind::Stopped, LifecycleEventKind::Started]
        );
        assert_eq!(f.storage.record(1).unwrap().descriptor.version, "1.0.0");
    }

    #[tokio::test]
    async fn test_uninstall_active_module() {
        let f = fixture();
        let m = install(&f, 1, ModuleDescriptor::new("clock", "1.0.0")).await;
        f.coordinator.controller().start(&m, false).await.unwrap();

        let mut sub = f.events.subscribe();
        f.coordinator.uninstall(&m).await.unwrap();
        assert_eq!(m.state(), ModuleState::Uninstalled);
        assert_eq!(
            kinds(&mut sub),
            vec![LifecycleEventKind::Stopped, LifecycleEventKind::Uninstalled]
        );
        assert!(f.storage.record(1).is_none());
        assert!(f.coordinator.controller().registry().get(1).await.is_none());

        let err = f.coordinator.controller().start(&m, false).await.unwrap_err();
        assert!(err.is_illegal_state());
        assert!(f.coordinator.uninstall(&m).await.unwrap_err().is_illegal_state());
    }

    #[tokio::test]
    async fn test_uninstall_marks_dependents() {
        let f = fixture();
        let core = install(&f, 1, ModuleDescriptor::new("core", "1.0.0")).await;
        let app = install(
            &f,
            2,
            ModuleDescriptor::new("app", "1.0.0").with_requirement("core", "^1"),
        )
        .await;
        f.coordinator.controller().resolve(&app).await.unwrap();

        f.coordinator.uninstall(&core).await.unwrap();
        let region = f.coordinator.controller().registry().exclusive().await;
        assert_eq!(region.marked(), vec![2]);
    }
}
