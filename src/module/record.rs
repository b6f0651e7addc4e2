//! 模块记录
//!
//! [`Module`] 是容器中每个已安装模块的内存记录。身份（ID、位置）在整个生命周期内不变；
//! 状态、修订、标志位和启动级别可以在不持有状态变更锁的情况下读取，
//! 但只能由生命周期控制器在持有锁时修改。

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::module::metadata::{ModuleDescriptor, ModuleState, PersistentFlags};
use crate::module::transition::TransitionLock;
use crate::utils::ModuleId;

/// 模块修订
///
/// 一次安装或更新产生一个修订。更新只替换修订，不改变模块身份。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRevision {
    /// 模块描述
    pub descriptor: ModuleDescriptor,
    /// 存储层的内容代数，每次更新加一
    pub generation: u64,
}

impl ModuleRevision {
    pub fn new(descriptor: ModuleDescriptor, generation: u64) -> Self {
        Self {
            descriptor,
            generation,
        }
    }
}

/// 模块之间的片段关系
#[derive(Debug, Clone)]
pub enum ModuleRelation {
    /// 普通模块，拥有独立的生命周期
    Standalone,
    /// 片段；`host` 为空表示尚未附着到宿主
    Fragment { host: Option<Arc<Module>> },
}

/// 生命周期操作的实际目标
#[derive(Debug, Clone)]
pub enum TransitionTarget {
    /// 模块自身
    Itself,
    /// 片段重定向到宿主
    Host(Arc<Module>),
    /// 未附着的片段，视为非活动，操作为空操作
    Detached,
}

/// 模块记录
#[derive(Debug)]
pub struct Module {
    id: ModuleId,
    location: String,
    state: AtomicU8,
    revision: RwLock<Arc<ModuleRevision>>,
    flags: AtomicU32,
    start_level: AtomicI32,
    host: RwLock<Option<Weak<Module>>>,
    last_permission_failure: Mutex<Option<String>>,
    last_modified: RwLock<DateTime<Utc>>,
    installed_at: DateTime<Utc>,
    transition: TransitionLock,
}

impl Module {
    /// 创建处于 INSTALLED 状态的模块记录
    pub fn new(
        id: ModuleId,
        location: impl Into<String>,
        revision: ModuleRevision,
        flags: PersistentFlags,
        start_level: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            location: location.into(),
            state: AtomicU8::new(ModuleState::Installed.as_u8()),
            revision: RwLock::new(Arc::new(revision)),
            flags: AtomicU32::new(flags.bits()),
            start_level: AtomicI32::new(start_level),
            host: RwLock::new(None),
            last_permission_failure: Mutex::new(None),
            last_modified: RwLock::new(now),
            installed_at: now,
            transition: TransitionLock::new(),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// 当前状态，不需要状态变更锁
    pub fn state(&self) -> ModuleState {
        ModuleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 设置状态，调用方必须持有本模块（或其宿主重定向路径上）的状态变更锁
    pub(crate) fn set_state(&self, state: ModuleState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn transition_lock(&self) -> &TransitionLock {
        &self.transition
    }

    /// 当前修订
    pub fn revision(&self) -> Arc<ModuleRevision> {
        self.revision
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 替换修订，返回旧修订
    pub(crate) fn replace_revision(&self, revision: Arc<ModuleRevision>) -> Arc<ModuleRevision> {
        let mut current = self.revision.write().unwrap_or_else(PoisonError::into_inner);
        *self.last_modified.write().unwrap_or_else(PoisonError::into_inner) = Utc::now();
        std::mem::replace(&mut *current, revision)
    }

    pub fn symbolic_name(&self) -> Option<String> {
        self.revision().descriptor.symbolic_name.clone()
    }

    pub fn version(&self) -> Version {
        self.revision().descriptor.parsed_version()
    }

    pub fn is_fragment(&self) -> bool {
        self.revision().descriptor.is_fragment()
    }

    /// 权限绑定，为空表示不做权限检查
    pub fn permission_binding(&self) -> Option<String> {
        self.revision().descriptor.permission_binding.clone()
    }

    pub fn flags(&self) -> PersistentFlags {
        PersistentFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: PersistentFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn is_auto_start(&self) -> bool {
        self.flags().contains(PersistentFlags::AUTO_START)
    }

    pub fn start_level(&self) -> i32 {
        self.start_level.load(Ordering::Acquire)
    }

    pub(crate) fn set_start_level(&self, level: i32) {
        self.start_level.store(level, Ordering::Release);
    }

    /// 最近一次解析时权限检查失败的诊断信息
    pub fn last_permission_failure(&self) -> Option<String> {
        self.last_permission_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_permission_failure(&self, failure: Option<String>) {
        *self
            .last_permission_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = failure;
    }

    pub fn installed_at(&self) -> DateTime<Utc> {
        self.installed_at
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        *self.last_modified.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 附着到宿主
    pub(crate) fn attach_host(&self, host: &Arc<Module>) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(host));
    }

    /// 从宿主脱离
    pub(crate) fn detach_host(&self) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 已附着且仍存活的宿主
    pub fn host(&self) -> Option<Arc<Module>> {
        self.host
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|host| host.state() != ModuleState::Uninstalled)
    }

    /// 当前的片段关系
    pub fn relation(&self) -> ModuleRelation {
        if self.is_fragment() {
            ModuleRelation::Fragment { host: self.host() }
        } else {
            ModuleRelation::Standalone
        }
    }

    /// 生命周期操作的实际目标：普通模块为自身，片段重定向到宿主
    pub fn transition_target(&self) -> TransitionTarget {
        match self.relation() {
            ModuleRelation::Standalone => TransitionTarget::Itself,
            ModuleRelation::Fragment { host: Some(host) } => TransitionTarget::Host(host),
            ModuleRelation::Fragment { host: None } => TransitionTarget::Detached,
        }
    }

    /// 生成对外展示的快照
    pub fn info(&self) -> ModuleInfo {
        let revision = self.revision();
        ModuleInfo {
            id: self.id,
            location: self.location.clone(),
            symbolic_name: revision.descriptor.symbolic_name.clone(),
            version: revision.descriptor.version.clone(),
            state: self.state(),
            start_level: self.start_level(),
            auto_start: self.is_auto_start(),
            fragment: revision.descriptor.is_fragment(),
            host: self.host().map(|h| h.id()),
            generation: revision.generation,
            last_modified: self.last_modified(),
        }
    }
}

/// 启动顺序比较：启动级别升序，相同时按 ID 升序
pub fn compare_start_order(a: &Module, b: &Module) -> CmpOrdering {
    a.start_level()
        .cmp(&b.start_level())
        .then_with(|| a.id().cmp(&b.id()))
}

/// 按启动顺序排序
pub fn sort_by_start_order(modules: &mut [Arc<Module>]) {
    modules.sort_by(|a, b| compare_start_order(a, b));
}

/// 模块信息快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub location: String,
    pub symbolic_name: Option<String>,
    pub version: String,
    pub state: ModuleState,
    pub start_level: i32,
    pub auto_start: bool,
    pub fragment: bool,
    pub host: Option<ModuleId>,
    pub generation: u64,
    pub last_modified: DateTime<Utc>,
}
