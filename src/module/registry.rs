//! 依赖注册表
//!
//! 保存所有已安装模块和它们之间的连线图。注册表的修改（安装、更新时的修订替换、
//! 卸载时的移除、解析时的连线、刷新）都在注册表级独占区内进行。
//!
//! 锁顺序：模块状态变更锁 -> 宿主状态变更锁 -> 注册表独占区。
//! 持有独占区时不得再获取任何模块的状态变更锁，也不得等待外部 IO。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use semver::Version;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::module::record::{sort_by_start_order, Module, ModuleRevision};
use crate::utils::ModuleId;

/// 注册表独占区
pub type RegistryRegion<'a> = MutexGuard<'a, RegistryState>;

/// 修订替换的结果，回滚时原样交回
#[derive(Debug)]
pub struct SwapOutcome {
    /// 替换前的修订
    pub old_revision: Arc<ModuleRevision>,
    /// 旧修订导出的能力是否正被其他模块使用
    pub in_use: bool,
    /// 旧修订的提供方（替换时取消连线）
    pub providers: Vec<ModuleId>,
}

/// 移除模块的结果，回滚时原样交回
#[derive(Debug)]
pub struct RemoveOutcome {
    pub in_use: bool,
    pub providers: Vec<ModuleId>,
    pub dependents: Vec<ModuleId>,
}

/// 注册表内容，只能通过 [`DependencyRegistry::exclusive`] 访问
#[derive(Debug, Default)]
pub struct RegistryState {
    modules: BTreeMap<ModuleId, Arc<Module>>,
    by_location: HashMap<String, ModuleId>,
    graph: crate::module::dependency::DependencyGraph,
    /// 因提供方更新或卸载而需要刷新的模块
    marked: BTreeSet<ModuleId>,
}

impl RegistryState {
    /// 添加模块
    pub fn add(&mut self, module: Arc<Module>) {
        debug!(module_id = module.id(), location = %module.location(), "注册表添加模块");
        self.graph.add_module(module.id());
        self.by_location
            .insert(module.location().to_string(), module.id());
        self.modules.insert(module.id(), module);
    }

    /// 移除模块并断开全部连线，返回 `None` 表示模块不在注册表中
    pub fn remove(&mut self, module_id: ModuleId) -> Option<RemoveOutcome> {
        let module = self.modules.remove(&module_id)?;
        self.by_location.remove(module.location());
        let outcome = RemoveOutcome {
            in_use: self.graph.has_dependents(module_id),
            providers: self.graph.providers(module_id),
            dependents: self.graph.dependents(module_id),
        };
        self.graph.remove_module(module_id);
        debug!(module_id, in_use = outcome.in_use, "注册表移除模块");
        Some(outcome)
    }

    /// 撤销 [`remove`](Self::remove)：重新加入模块并恢复连线
    pub fn readd(&mut self, module: Arc<Module>, outcome: &RemoveOutcome) {
        let module_id = module.id();
        self.add(module);
        for provider in &outcome.providers {
            self.graph.add_wire(module_id, *provider);
        }
        for dependent in &outcome.dependents {
            self.graph.add_wire(*dependent, module_id);
        }
    }

    /// 用新修订替换模块的当前修订
    ///
    /// 模块自身的连线被断开（新修订需要重新解析），使用它的模块保持连线直到刷新。
    pub fn swap(&mut self, module: &Module, revision: Arc<ModuleRevision>) -> SwapOutcome {
        let module_id = module.id();
        let in_use = self.graph.has_dependents(module_id);
        let providers = self.graph.unwire(module_id);
        let old_revision = module.replace_revision(revision);
        debug!(module_id, in_use, "注册表替换模块修订");
        SwapOutcome {
            old_revision,
            in_use,
            providers,
        }
    }

    /// 撤销 [`swap`](Self::swap)：换回旧修订并恢复连线
    pub fn revert_swap(&mut self, module: &Module, outcome: SwapOutcome) {
        let module_id = module.id();
        module.replace_revision(outcome.old_revision);
        self.graph.unwire(module_id);
        for provider in outcome.providers {
            self.graph.add_wire(module_id, provider);
        }
    }

    /// 标记所有（传递）使用该模块的模块，等待刷新
    pub fn mark_dependents(&mut self, module_id: ModuleId) {
        let dependents = self.graph.transitive_dependents(module_id);
        self.marked.extend(dependents);
    }

    /// 取出并清空待刷新标记，只返回仍在注册表中的模块
    pub fn take_marked(&mut self) -> Vec<Arc<Module>> {
        let marked = std::mem::take(&mut self.marked);
        let mut modules: Vec<_> = marked
            .into_iter()
            .filter_map(|id| self.modules.get(&id).cloned())
            .collect();
        sort_by_start_order(&mut modules);
        modules
    }

    pub fn marked(&self) -> Vec<ModuleId> {
        self.marked.iter().copied().collect()
    }

    pub fn get(&self, module_id: ModuleId) -> Option<Arc<Module>> {
        self.modules.get(&module_id).cloned()
    }

    pub fn find_by_location(&self, location: &str) -> Option<Arc<Module>> {
        self.by_location
            .get(location)
            .and_then(|id| self.modules.get(id))
            .cloned()
    }

    /// 按符号名和版本查找，`exclude` 指定的模块不参与比较
    pub fn find_by_name_version(
        &self,
        symbolic_name: &str,
        version: &Version,
        exclude: Option<ModuleId>,
    ) -> Option<Arc<Module>> {
        self.modules
            .values()
            .filter(|m| Some(m.id()) != exclude)
            .find(|m| {
                m.symbolic_name().as_deref() == Some(symbolic_name) && &m.version() == version
            })
            .cloned()
    }

    /// 全部已安装模块
    pub fn modules(&self) -> &BTreeMap<ModuleId, Arc<Module>> {
        &self.modules
    }

    pub fn graph(&self) -> &crate::module::dependency::DependencyGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut crate::module::dependency::DependencyGraph {
        &mut self.graph
    }

    /// 声明了给定宿主的全部片段
    pub fn fragments_of(&self, host: &Module) -> Vec<Arc<Module>> {
        let Some(host_name) = host.symbolic_name() else {
            return vec![];
        };
        self.modules
            .values()
            .filter(|m| {
                m.revision()
                    .descriptor
                    .fragment_host
                    .as_ref()
                    .map(|h| h.symbolic_name == host_name)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// 依赖注册表
#[derive(Debug, Default)]
pub struct DependencyRegistry {
    state: Mutex<RegistryState>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进入注册表级独占区
    pub async fn exclusive(&self) -> RegistryRegion<'_> {
        self.state.lock().await
    }

    pub async fn get(&self, module_id: ModuleId) -> Option<Arc<Module>> {
        self.exclusive().await.get(module_id)
    }

    pub async fn find_by_location(&self, location: &str) -> Option<Arc<Module>> {
        self.exclusive().await.find_by_location(location)
    }

    pub async fn find_by_name_version(
        &self,
        symbolic_name: &str,
        version: &Version,
    ) -> Option<Arc<Module>> {
        self.exclusive()
            .await
            .find_by_name_version(symbolic_name, version, None)
    }

    /// 按启动顺序列出全部模块
    pub async fn list(&self) -> Vec<Arc<Module>> {
        let mut modules: Vec<_> = self.exclusive().await.modules.values().cloned().collect();
        sort_by_start_order(&mut modules);
        modules
    }

    pub async fn len(&self) -> usize {
        self.exclusive().await.modules.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::{ModuleDescriptor, PersistentFlags};

    fn module(id: ModuleId, name: &str, version: &str) -> Arc<Module> {
        Arc::new(Module::new(
            id,
            format!("mem:{}", name),
            ModuleRevision::new(ModuleDescriptor::new(name, version), 0),
            PersistentFlags::empty(),
            1,
        ))
    }

    #[tokio::test]
    async fn test_add_and_find() {
        let registry = DependencyRegistry::new();
        registry.exclusive().await.add(module(1, "core", "1.0.0"));
        registry.exclusive().await.add(module(2, "editor", "2.0.0"));

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.find_by_location("mem:editor").await.map(|m| m.id()), Some(2));
        assert!(registry
            .find_by_name_version("core", &Version::new(1, 0, 0))
            .await
            .is_some());
        assert!(registry
            .find_by_name_version("core", &Version::new(1, 0, 1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_reports_in_use_and_readd_restores() {
        let registry = DependencyRegistry::new();
        let core = module(1, "core", "1.0.0");
        let mut region = registry.exclusive().await;
        region.add(core.clone());
        region.add(module(2, "editor", "1.0.0"));
        region.graph_mut().add_wire(2, 1);

        let outcome = region.remove(1).unwrap();
        assert!(outcome.in_use);
        assert!(region.get(1).is_none());
        assert!(region.find_by_location("mem:core").is_none());

        region.readd(core, &outcome);
        assert!(region.get(1).is_some());
        assert_eq!(region.graph().dependents(1), vec![2]);
    }

    #[tokio::test]
    async fn test_swap_and_revert() {
        let registry = DependencyRegistry::new();
        let editor = module(2, "editor", "1.0.0");
        let mut region = registry.exclusive().await;
        region.add(module(1, "core", "1.0.0"));
        region.add(editor.clone());
        region.graph_mut().add_wire(2, 1);

        let outcome = region.swap(
            &editor,
            Arc::new(ModuleRevision::new(ModuleDescriptor::new("editor", "1.1.0"), 1)),
        );
        assert!(!outcome.in_use);
        assert_eq!(outcome.providers, vec![1]);
        assert_eq!(editor.version(), Version::new(1, 1, 0));
        assert!(region.graph().providers(2).is_empty());

        region.revert_swap(&editor, outcome);
        assert_eq!(editor.version(), Version::new(1, 0, 0));
        assert_eq!(region.graph().providers(2), vec![1]);
    }

    #[tokio::test]
    async fn test_mark_dependents_transitively() {
        let registry = DependencyRegistry::new();
        let mut region = registry.exclusive().await;
        for (id, name) in [(1, "core"), (2, "text"), (3, "editor")] {
            region.add(module(id, name, "1.0.0"));
        }
        region.graph_mut().add_wire(2, 1);
        region.graph_mut().add_wire(3, 2);

        region.mark_dependents(1);
        assert_eq!(region.marked(), vec![2, 3]);

        let marked: Vec<_> = region.take_marked().iter().map(|m| m.id()).collect();
        assert_eq!(marked, vec![2, 3]);
        assert!(region.marked().is_empty());
    }

    #[tokio::test]
    async fn test_find_excludes_self() {
        let registry = DependencyRegistry::new();
        let mut region = registry.exclusive().await;
        region.add(module(1, "core", "1.0.0"));
        assert!(region
            .find_by_name_version("core", &Version::new(1, 0, 0), Some(1))
            .is_none());
    }
}
