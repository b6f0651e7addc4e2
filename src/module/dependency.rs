//! 模块依赖管理
//!
//! 本模块提供模块之间的连线图和解析器。
//!
//! # 主要组件
//!
//! - [`DependencyGraph`] - 连线图，记录"谁在使用谁导出的能力"
//! - [`Resolver`] - 解析器接口，为一个模块的全部约束找到提供方
//! - [`GraphResolver`] - 默认解析器：包导入、模块依赖和片段宿主的简单匹配
//!
//! # 示例
//!
//! ```rust
//! use chips_container::module::dependency::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_wire(2, 1);
//! graph.add_wire(3, 1);
//!
//! assert_eq!(graph.dependents(1), vec![2, 3]);
//! assert!(graph.has_dependents(1));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use semver::Version;

use crate::module::metadata::{parse_version_req, ModuleState};
use crate::module::record::Module;
use crate::utils::ModuleId;

/// 模块连线图
///
/// 正向边：使用方 -> 提供方；反向边：提供方 -> 使用方。
/// 与模块间的循环依赖兼容，连线图只用于判断"是否有人在用"和刷新范围。
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: HashMap<ModuleId, BTreeSet<ModuleId>>,
    reverse_edges: HashMap<ModuleId, BTreeSet<ModuleId>>,
}

impl DependencyGraph {
    /// 创建一个空的连线图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块节点，已存在时不变
    pub fn add_module(&mut self, module_id: ModuleId) {
        self.edges.entry(module_id).or_default();
        self.reverse_edges.entry(module_id).or_default();
    }

    /// 添加连线：`requirer` 使用 `provider` 提供的能力
    ///
    /// 模块连到自身不记录。
    pub fn add_wire(&mut self, requirer: ModuleId, provider: ModuleId) {
        self.add_module(requirer);
        self.add_module(provider);
        if requirer == provider {
            return;
        }
        self.edges.entry(requirer).or_default().insert(provider);
        self.reverse_edges.entry(provider).or_default().insert(requirer);
    }

    /// 移除模块自身的全部出边（取消连线），返回原来的提供方
    ///
    /// 入边保留：使用本模块的其他模块在刷新前继续连在旧修订上。
    pub fn unwire(&mut self, module_id: ModuleId) -> Vec<ModuleId> {
        let providers = self
            .edges
            .get_mut(&module_id)
            .map(std::mem::take)
            .unwrap_or_default();
        for provider in &providers {
            if let Some(users) = self.reverse_edges.get_mut(provider) {
                users.remove(&module_id);
            }
        }
        providers.into_iter().collect()
    }

    /// 移除模块及其所有连线
    pub fn remove_module(&mut self, module_id: ModuleId) {
        self.unwire(module_id);
        if let Some(dependents) = self.reverse_edges.remove(&module_id) {
            for dependent in dependents {
                if let Some(providers) = self.edges.get_mut(&dependent) {
                    providers.remove(&module_id);
                }
            }
        }
        self.edges.remove(&module_id);
    }

    /// 模块直接使用的提供方
    pub fn providers(&self, module_id: ModuleId) -> Vec<ModuleId> {
        self.edges
            .get(&module_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 直接使用该模块的模块
    pub fn dependents(&self, module_id: ModuleId) -> Vec<ModuleId> {
        self.reverse_edges
            .get(&module_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 是否有其他模块连在该模块上
    pub fn has_dependents(&self, module_id: ModuleId) -> bool {
        self.reverse_edges
            .get(&module_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// 传递使用该模块的全部模块（不含自身）
    pub fn transitive_dependents(&self, module_id: ModuleId) -> BTreeSet<ModuleId> {
        let mut result = BTreeSet::new();
        let mut stack = vec![module_id];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if dependent != module_id && result.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        result
    }

    pub fn contains_module(&self, module_id: ModuleId) -> bool {
        self.edges.contains_key(&module_id)
    }

    pub fn module_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

// ==================== 解析 ====================

/// 连线种类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireKind {
    /// 包导入，值为包名
    Package(String),
    /// 模块依赖，值为被依赖模块的符号名
    Module(String),
    /// 片段附着到宿主，值为宿主符号名
    Host(String),
}

/// 一条解析得到的连线
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wire {
    pub kind: WireKind,
    pub provider: ModuleId,
}

/// 解析结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// 模块自身的连线
    pub wires: Vec<Wire>,
}

impl Resolution {
    /// 片段解析得到的宿主
    pub fn host(&self) -> Option<ModuleId> {
        self.wires.iter().find_map(|wire| match wire.kind {
            WireKind::Host(_) => Some(wire.provider),
            _ => None,
        })
    }
}

/// 依赖解析器
///
/// 在注册表独占区内同步调用，`installed` 是当前全部已安装模块。
/// 无法满足的非可选约束以 `Err(描述)` 返回。
pub trait Resolver: Send + Sync {
    fn resolve(
        &self,
        module: &Module,
        installed: &BTreeMap<ModuleId, Arc<Module>>,
    ) -> std::result::Result<Resolution, String>;
}

/// 默认解析器
///
/// - 包导入连到导出该包且版本匹配的模块，多个候选时取版本最高者，其次 ID 最小者
/// - 模块依赖连到符号名相同且版本匹配的模块
/// - 片段连到符号名相同且版本匹配的非片段宿主
///
/// 已卸载的模块和其他片段不会成为提供方。
#[derive(Debug, Clone, Default)]
pub struct GraphResolver;

impl GraphResolver {
    pub fn new() -> Self {
        Self
    }

    fn candidates<'a>(
        module: &'a Module,
        installed: &'a BTreeMap<ModuleId, Arc<Module>>,
    ) -> impl Iterator<Item = &'a Arc<Module>> + 'a {
        installed.values().filter(move |candidate| {
            candidate.id() != module.id()
                && candidate.state() != ModuleState::Uninstalled
                && !candidate.is_fragment()
        })
    }

    /// 按版本从高到低、ID 从小到大挑选
    fn best<'a>(
        matches: impl Iterator<Item = (&'a Arc<Module>, Version)>,
    ) -> Option<&'a Arc<Module>> {
        matches
            .max_by(|(a, va), (b, vb)| va.cmp(vb).then_with(|| b.id().cmp(&a.id())))
            .map(|(module, _)| module)
    }
}

impl Resolver for GraphResolver {
    fn resolve(
        &self,
        module: &Module,
        installed: &BTreeMap<ModuleId, Arc<Module>>,
    ) -> std::result::Result<Resolution, String> {
        let revision = module.revision();
        let descriptor = &revision.descriptor;
        let mut resolution = Resolution::default();
        let mut missing: Vec<String> = Vec::new();

        for import in &descriptor.imports {
            let Some(req) = parse_version_req(&import.version) else {
                missing.push(format!("import {} {}", import.name, import.version));
                continue;
            };
            // 模块自己导出的包直接满足自己的导入
            if descriptor.exports.iter().any(|e| {
                e.name == import.name
                    && Version::parse(&e.version).map(|v| req.matches(&v)).unwrap_or(false)
            }) {
                continue;
            }
            let provider = Self::best(Self::candidates(module, installed).flat_map(|c| {
                let rev = c.revision();
                rev.descriptor
                    .exports
                    .iter()
                    .filter(|e| e.name == import.name)
                    .filter_map(|e| Version::parse(&e.version).ok())
                    .filter(|v| req.matches(v))
                    .max()
                    .map(|v| (c, v))
            }));
            match provider {
                Some(provider) => resolution.wires.push(Wire {
                    kind: WireKind::Package(import.name.clone()),
                    provider: provider.id(),
                }),
                None if import.optional => {}
                None => missing.push(format!("import {} {}", import.name, import.version)),
            }
        }

        for requirement in &descriptor.requires {
            let Some(req) = parse_version_req(&requirement.version) else {
                missing.push(format!("require {} {}", requirement.symbolic_name, requirement.version));
                continue;
            };
            let provider = Self::best(
                Self::candidates(module, installed)
                    .filter(|c| c.symbolic_name().as_deref() == Some(requirement.symbolic_name.as_str()))
                    .map(|c| (c, c.version()))
                    .filter(|(_, v)| req.matches(v)),
            );
            match provider {
                Some(provider) => resolution.wires.push(Wire {
                    kind: WireKind::Module(requirement.symbolic_name.clone()),
                    provider: provider.id(),
                }),
                None if requirement.optional => {}
                None => missing.push(format!(
                    "require {} {}",
                    requirement.symbolic_name, requirement.version
                )),
            }
        }

        if let Some(ref host) = descriptor.fragment_host {
            let req = parse_version_req(&host.version);
            let provider = Self::best(
                Self::candidates(module, installed)
                    .filter(|c| c.symbolic_name().as_deref() == Some(host.symbolic_name.as_str()))
                    .map(|c| (c, c.version()))
                    .filter(|(_, v)| req.as_ref().map(|r| r.matches(v)).unwrap_or(false)),
            );
            match provider {
                Some(provider) => resolution.wires.push(Wire {
                    kind: WireKind::Host(host.symbolic_name.clone()),
                    provider: provider.id(),
                }),
                None => missing.push(format!("host {} {}", host.symbolic_name, host.version)),
            }
        }

        if missing.is_empty() {
            Ok(resolution)
        } else {
            Err(format!("缺少约束: {}", missing.join(", ")))
        }
    }
}
