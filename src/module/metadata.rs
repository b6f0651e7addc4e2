//! 模块元数据定义
//!
//! 定义模块描述文件 (module.yaml) 中的数据结构，以及模块生命周期状态、
//! 能力种类和持久化标志位。

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 模块状态
///
/// 任意时刻一个模块恰好处于其中一种状态。`Uninstalled` 是终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ModuleState {
    /// 已安装，尚未解析
    Installed = 1,
    /// 依赖已解析，可以启动
    Resolved = 2,
    /// 激活器正在启动
    Starting = 3,
    /// 运行中
    Active = 4,
    /// 激活器正在停止
    Stopping = 5,
    /// 已卸载
    Uninstalled = 6,
}

impl ModuleState {
    /// 转换为原子存储使用的数值
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// 从原子存储的数值还原，未知值视为 `Uninstalled`
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ModuleState::Installed,
            2 => ModuleState::Resolved,
            3 => ModuleState::Starting,
            4 => ModuleState::Active,
            5 => ModuleState::Stopping,
            _ => ModuleState::Uninstalled,
        }
    }

    /// 是否已解析（RESOLVED 及之后的活动状态）
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            ModuleState::Resolved | ModuleState::Starting | ModuleState::Active | ModuleState::Stopping
        )
    }

    /// 是否处于启动中或运行中
    pub fn is_active_or_starting(self) -> bool {
        matches!(self, ModuleState::Active | ModuleState::Starting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 能力种类
///
/// 模块之间的每种关系都由一对能力把关：提供方持有 export/provide/host，
/// 使用方持有 import/require/fragment。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// 导出包
    Export,
    /// 导入包
    Import,
    /// 作为被依赖的模块
    Provide,
    /// 依赖其他模块
    Require,
    /// 允许片段附着
    Host,
    /// 作为片段附着到宿主
    Fragment,
}

impl CapabilityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "export" => Some(CapabilityKind::Export),
            "import" => Some(CapabilityKind::Import),
            "provide" => Some(CapabilityKind::Provide),
            "require" => Some(CapabilityKind::Require),
            "host" => Some(CapabilityKind::Host),
            "fragment" => Some(CapabilityKind::Fragment),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Export => "export",
            CapabilityKind::Import => "import",
            CapabilityKind::Provide => "provide",
            CapabilityKind::Require => "require",
            CapabilityKind::Host => "host",
            CapabilityKind::Fragment => "fragment",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化标志位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistentFlags(u32);

impl PersistentFlags {
    /// 容器下次启动时自动启动
    pub const AUTO_START: PersistentFlags = PersistentFlags(0x1);

    pub const fn empty() -> Self {
        PersistentFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        PersistentFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: PersistentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PersistentFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PersistentFlags) {
        self.0 &= !other.0;
    }
}

/// 导出的包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageExport {
    /// 包名
    pub name: String,
    /// 包版本
    #[serde(default = "default_version")]
    pub version: String,
}

/// 导入的包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageImport {
    pub name: String,
    /// 版本范围（semver）
    #[serde(default = "default_version_req")]
    pub version: String,
    /// 可选导入，找不到提供方时不影响解析
    #[serde(default)]
    pub optional: bool,
}

/// 模块依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequirement {
    /// 被依赖模块的符号名
    pub symbolic_name: String,
    #[serde(default = "default_version_req")]
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

/// 片段宿主声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHost {
    pub symbolic_name: String,
    #[serde(default = "default_version_req")]
    pub version: String,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_version_req() -> String {
    "*".to_string()
}

/// 解析版本范围，无效时返回 `None`
pub fn parse_version_req(req: &str) -> Option<VersionReq> {
    VersionReq::parse(req).ok()
}

/// 模块描述
///
/// 对应 module.yaml 文件中的配置。一次更新会整体替换描述，
/// 但模块 ID 保持不变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// 符号名，匿名模块为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbolic_name: Option<String>,

    /// 版本（semver 格式）
    #[serde(default = "default_version")]
    pub version: String,

    /// 显示名称
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// 激活器名称，对应 `ActivatorRegistry` 中注册的工厂；为空时启动和停止只切换状态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activator: Option<String>,

    #[serde(default)]
    pub exports: Vec<PackageExport>,

    #[serde(default)]
    pub imports: Vec<PackageImport>,

    #[serde(default)]
    pub requires: Vec<ModuleRequirement>,

    /// 片段宿主，存在时本模块是片段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_host: Option<FragmentHost>,

    /// 权限绑定名，为空表示不做权限限制
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_binding: Option<String>,

    /// 自定义属性
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ModuleDescriptor {
    /// 创建新的模块描述
    pub fn new(symbolic_name: impl Into<String>, version: impl Into<String>) -> Self {
        let symbolic_name = symbolic_name.into();
        Self {
            name: symbolic_name.clone(),
            symbolic_name: Some(symbolic_name),
            version: version.into(),
            description: String::new(),
            activator: None,
            exports: vec![],
            imports: vec![],
            requires: vec![],
            fragment_host: None,
            permission_binding: None,
            properties: BTreeMap::new(),
        }
    }

    /// 创建匿名模块描述
    pub fn anonymous(version: impl Into<String>) -> Self {
        let mut descriptor = Self::new("", version);
        descriptor.symbolic_name = None;
        descriptor
    }

    pub fn with_activator(mut self, activator: impl Into<String>) -> Self {
        self.activator = Some(activator.into());
        self
    }

    pub fn with_export(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.exports.push(PackageExport {
            name: name.into(),
            version: version.into(),
        });
        self
    }

    pub fn with_import(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.imports.push(PackageImport {
            name: name.into(),
            version: version.into(),
            optional: false,
        });
        self
    }

    pub fn with_requirement(
        mut self,
        symbolic_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.requires.push(ModuleRequirement {
            symbolic_name: symbolic_name.into(),
            version: version.into(),
            optional: false,
        });
        self
    }

    /// 声明为某个宿主的片段
    pub fn fragment_of(mut self, host: impl Into<String>, version: impl Into<String>) -> Self {
        self.fragment_host = Some(FragmentHost {
            symbolic_name: host.into(),
            version: version.into(),
        });
        self
    }

    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.permission_binding = Some(binding.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// 解析版本号，无效时为 0.0.0
    pub fn parsed_version(&self) -> Version {
        Version::parse(&self.version).unwrap_or_else(|_| Version::new(0, 0, 0))
    }

    /// 是否是片段
    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }

    /// 符号名，匿名时为空字符串
    pub fn symbolic_name_or_empty(&self) -> &str {
        self.symbolic_name.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip_through_u8() {
        for state in [
            ModuleState::Installed,
            ModuleState::Resolved,
            ModuleState::Starting,
            ModuleState::Active,
            ModuleState::Stopping,
            ModuleState::Uninstalled,
        ] {
            assert_eq!(ModuleState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ModuleState::from_u8(0), ModuleState::Uninstalled);
    }

    #[test]
    fn test_state_classification() {
        assert!(ModuleState::Active.is_resolved());
        assert!(!ModuleState::Installed.is_resolved());
        assert!(!ModuleState::Uninstalled.is_resolved());
        assert!(ModuleState::Starting.is_active_or_starting());
        assert!(!ModuleState::Stopping.is_active_or_starting());
        assert_eq!(ModuleState::Active.to_string(), "ACTIVE");
    }

    #[test]
    fn test_capability_parse() {
        assert_eq!(CapabilityKind::parse("Export"), Some(CapabilityKind::Export));
        assert_eq!(CapabilityKind::parse("fragment"), Some(CapabilityKind::Fragment));
        assert_eq!(CapabilityKind::parse("teleport"), None);
    }

    #[test]
    fn test_persistent_flags() {
        let mut flags = PersistentFlags::empty();
        assert!(!flags.contains(PersistentFlags::AUTO_START));
        flags.insert(PersistentFlags::AUTO_START);
        assert!(flags.contains(PersistentFlags::AUTO_START));
        assert_eq!(flags.bits(), 0x1);
        flags.remove(PersistentFlags::AUTO_START);
        assert!(!flags.contains(PersistentFlags::AUTO_START));
        assert_eq!(PersistentFlags::from_bits(0x1), PersistentFlags::AUTO_START);
    }

    #[test]
    fn test_descriptor_yaml_defaults() {
        let yaml = r#"
symbolic_name: chips.editor
version: 1.2.0
imports:
  - name: chips.text
fragment_host:
  symbolic_name: chips.shell
"#;
        let descriptor: ModuleDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.imports[0].version, "*");
        assert!(!descriptor.imports[0].optional);
        assert!(descriptor.is_fragment());
        assert_eq!(descriptor.parsed_version(), Version::new(1, 2, 0));
    }

    #[test]
    fn test_anonymous_descriptor() {
        let descriptor = ModuleDescriptor::anonymous("1.0.0");
        assert!(descriptor.symbolic_name.is_none());
        assert_eq!(descriptor.symbolic_name_or_empty(), "");
    }
}
