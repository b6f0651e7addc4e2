//! 权限检查
//!
//! 容器只消费权限判定的是/否结果：
//! - 管理操作（安装、启动、停止、更新、卸载）调用 [`PrivilegeGate::check_admin`]
//! - 解析时对每条连线的双方检查能力（导出/导入、提供/依赖、宿主/片段）
//!
//! 没有权限绑定的模块视为不受限。

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::SecurityConfig;
use crate::module::dependency::{Resolution, WireKind};
use crate::module::metadata::CapabilityKind;
use crate::module::record::Module;
use crate::utils::{CoreError, ModuleId, Result};

/// 权限判定
pub trait PrivilegeGate: Send + Sync {
    /// 检查管理权限，被拒绝时返回 `PermissionDenied`
    fn check_admin(&self, action: &str) -> Result<()>;

    /// 权限绑定是否拥有给定能力
    fn has_capability(&self, binding: &str, kind: CapabilityKind, name: &str) -> bool;
}

/// 不做任何限制
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl PrivilegeGate for Unrestricted {
    fn check_admin(&self, _action: &str) -> Result<()> {
        Ok(())
    }

    fn has_capability(&self, _binding: &str, _kind: CapabilityKind, _name: &str) -> bool {
        true
    }
}

/// 编译后的授权
#[derive(Debug, Clone)]
struct CompiledGrant {
    kind: CapabilityKind,
    pattern: Regex,
}

/// 基于配置授权表的权限判定
#[derive(Debug, Clone)]
pub struct PolicyGate {
    allow_admin: bool,
    grants: HashMap<String, Vec<CompiledGrant>>,
}

impl PolicyGate {
    /// 从配置构建
    ///
    /// # Errors
    ///
    /// 授权的能力种类无法识别，或名称模式无法编译时返回 `InvalidConfigValue`
    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        let mut grants = HashMap::new();
        for (binding, entries) in &config.grants {
            let mut compiled = Vec::with_capacity(entries.len());
            for entry in entries {
                let kind = CapabilityKind::parse(&entry.kind).ok_or_else(|| {
                    CoreError::InvalidConfigValue {
                        key: format!("security.grants.{}", binding),
                        reason: format!("未知的能力种类: {}", entry.kind),
                    }
                })?;
                let pattern = Regex::new(&glob_to_regex(&entry.name)).map_err(|e| {
                    CoreError::InvalidConfigValue {
                        key: format!("security.grants.{}", binding),
                        reason: e.to_string(),
                    }
                })?;
                compiled.push(CompiledGrant { kind, pattern });
            }
            grants.insert(binding.clone(), compiled);
        }
        debug!(bindings = grants.len(), allow_admin = config.allow_admin, "构建权限策略");
        Ok(Self {
            allow_admin: config.allow_admin,
            grants,
        })
    }
}

impl PrivilegeGate for PolicyGate {
    fn check_admin(&self, action: &str) -> Result<()> {
        if self.allow_admin {
            Ok(())
        } else {
            warn!(action, "管理操作被拒绝");
            Err(CoreError::PermissionDenied(format!("不允许执行管理操作: {}", action)))
        }
    }

    fn has_capability(&self, binding: &str, kind: CapabilityKind, name: &str) -> bool {
        self.grants
            .get(binding)
            .map(|grants| {
                grants
                    .iter()
                    .any(|grant| grant.kind == kind && grant.pattern.is_match(name))
            })
            .unwrap_or(false)
    }
}

/// 按配置选择权限判定
pub fn gate_from_config(config: &SecurityConfig) -> Result<Arc<dyn PrivilegeGate>> {
    if config.enabled {
        Ok(Arc::new(PolicyGate::from_config(config)?))
    } else {
        Ok(Arc::new(Unrestricted))
    }
}

/// `*` 匹配任意串，`?` 匹配单个字符
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => regex.push(ch),
        }
    }
    regex.push('$');
    regex
}

fn permitted(gate: &dyn PrivilegeGate, module: &Module, kind: CapabilityKind, name: &str) -> bool {
    match module.permission_binding() {
        Some(binding) => gate.has_capability(&binding, kind, name),
        None => true,
    }
}

fn describe(module: Option<&Arc<Module>>) -> String {
    match module {
        Some(m) => format!("{} [{}]", m.symbolic_name().unwrap_or_default(), m.id()),
        None => "<missing>".to_string(),
    }
}

/// 检查解析结果中每条连线双方的权限
///
/// 依次检查包（导出方 export、导入方 import）、模块依赖（提供方 provide、
/// 依赖方 require）、片段宿主（宿主 host、片段 fragment），遇到第一对不满足的
/// 立即返回描述该能力的诊断信息。
pub fn check_permissions(
    module: &Module,
    resolution: &Resolution,
    installed: &BTreeMap<ModuleId, Arc<Module>>,
    gate: &dyn PrivilegeGate,
) -> std::result::Result<(), String> {
    let pairs = [
        (CapabilityKind::Export, CapabilityKind::Import),
        (CapabilityKind::Provide, CapabilityKind::Require),
        (CapabilityKind::Host, CapabilityKind::Fragment),
    ];

    for (supply, consume) in pairs {
        for wire in &resolution.wires {
            let name = match (&wire.kind, supply) {
                (WireKind::Package(name), CapabilityKind::Export)
                | (WireKind::Module(name), CapabilityKind::Provide)
                | (WireKind::Host(name), CapabilityKind::Host) => name,
                _ => continue,
            };

            let supplier = installed.get(&wire.provider);
            let supplier_ok = supplier
                .map(|s| permitted(gate, s, supply, name))
                .unwrap_or(false);
            if !supplier_ok {
                return Err(format!(
                    "模块 {} 没有 {} 权限: {}",
                    describe(supplier),
                    supply,
                    name
                ));
            }

            if !permitted(gate, module, consume, name) {
                return Err(format!(
                    "模块 {} [{}] 没有 {} 权限: {}",
                    module.symbolic_name().unwrap_or_default(),
                    module.id(),
                    consume,
                    name
                ));
            }
        }
    }
    Ok(())
}
