//! 容器配置
//!
//! 定义容器的配置结构和加载逻辑。配置文件可以是 YAML 或 JSON（按扩展名判断），
//! 所有字段都有默认值，配置文件只需写出要覆盖的部分。

use crate::utils::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// 生命周期配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// 等待状态变更锁的上限（毫秒），只等待一轮
    #[serde(default = "default_state_change_timeout_ms")]
    pub state_change_timeout_ms: u64,

    /// 新安装模块的启动级别
    #[serde(default = "default_start_level")]
    pub default_start_level: i32,

    /// 容器当前的活动启动级别，启动级别高于它的模块不会在 launch 时启动
    #[serde(default = "default_start_level")]
    pub active_start_level: i32,
}

fn default_state_change_timeout_ms() -> u64 {
    5000
}

fn default_start_level() -> i32 {
    1
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            state_change_timeout_ms: default_state_change_timeout_ms(),
            default_start_level: default_start_level(),
            active_start_level: default_start_level(),
        }
    }
}

/// 持久化配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据目录，为空时使用内存存储（重启后不保留）
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// 单条能力授权
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantConfig {
    /// 能力种类，例如 "export"、"import"、"host"
    pub kind: String,
    /// 能力名称，支持 `*` 通配
    #[serde(default = "default_grant_name")]
    pub name: String,
}

fn default_grant_name() -> String {
    "*".to_string()
}

/// 权限配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// 是否启用权限检查，关闭时所有检查直接通过
    #[serde(default)]
    pub enabled: bool,

    /// 是否允许管理操作（安装、启动、停止、更新、卸载）
    #[serde(default = "default_true")]
    pub allow_admin: bool,

    /// 权限绑定名 -> 授权列表
    #[serde(default)]
    pub grants: HashMap<String, Vec<GrantConfig>>,
}

fn default_true() -> bool {
    true
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_admin: true,
            grants: HashMap::new(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 保留日志文件数
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            max_files: default_max_files(),
        }
    }
}

/// 容器配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

impl ContainerConfig {
    /// 创建配置构建器
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// `.json` 扩展名按 JSON 解析，其余按 YAML 解析。加载后会执行 [`validate`](Self::validate)。
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("无法读取 {}: {}", path.display(), e))
        })?;

        let mut config: ContainerConfig =
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                serde_json::from_str(&content)?
            } else {
                serde_yaml::from_str(&content)?
            };

        config.validate()?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.lifecycle.state_change_timeout_ms == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "lifecycle.state_change_timeout_ms".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.lifecycle.default_start_level < 1 {
            return Err(CoreError::InvalidConfigValue {
                key: "lifecycle.default_start_level".to_string(),
                reason: "启动级别从 1 开始".to_string(),
            });
        }
        if self.lifecycle.active_start_level < 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "lifecycle.active_start_level".to_string(),
                reason: "不能为负数".to_string(),
            });
        }
        for (binding, grants) in &self.security.grants {
            for grant in grants {
                if crate::module::metadata::CapabilityKind::parse(&grant.kind).is_none() {
                    return Err(CoreError::InvalidConfigValue {
                        key: format!("security.grants.{}", binding),
                        reason: format!("未知的能力种类 '{}'", grant.kind),
                    });
                }
            }
        }
        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    ///
    /// 只有 `other` 中不等于默认值的字段才会覆盖当前值。
    pub fn merge(&mut self, other: ContainerConfig) {
        let lifecycle_defaults = LifecycleConfig::default();
        if other.lifecycle.state_change_timeout_ms != lifecycle_defaults.state_change_timeout_ms {
            self.lifecycle.state_change_timeout_ms = other.lifecycle.state_change_timeout_ms;
        }
        if other.lifecycle.default_start_level != lifecycle_defaults.default_start_level {
            self.lifecycle.default_start_level = other.lifecycle.default_start_level;
        }
        if other.lifecycle.active_start_level != lifecycle_defaults.active_start_level {
            self.lifecycle.active_start_level = other.lifecycle.active_start_level;
        }
        if other.storage.data_dir.is_some() {
            self.storage.data_dir = other.storage.data_dir;
        }
        if other.security.enabled {
            self.security.enabled = true;
        }
        if !other.security.allow_admin {
            self.security.allow_admin = false;
        }
        self.security.grants.extend(other.security.grants);
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置状态变更锁等待上限
    pub fn state_change_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.lifecycle.state_change_timeout_ms = timeout_ms;
        self
    }

    pub fn default_start_level(mut self, level: i32) -> Self {
        self.config.lifecycle.default_start_level = level;
        self
    }

    pub fn active_start_level(mut self, level: i32) -> Self {
        self.config.lifecycle.active_start_level = level;
        self
    }

    /// 设置数据目录（启用文件存储）
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.data_dir = Some(dir.into());
        self
    }

    /// 启用权限检查
    pub fn enable_security(mut self) -> Self {
        self.config.security.enabled = true;
        self
    }

    pub fn allow_admin(mut self, allow: bool) -> Self {
        self.config.security.allow_admin = allow;
        self
    }

    /// 为权限绑定添加一条授权
    pub fn grant(
        mut self,
        binding: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.config
            .security
            .grants
            .entry(binding.into())
            .or_default()
            .push(GrantConfig {
                kind: kind.into(),
                name: name.into(),
            });
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    pub fn build(self) -> ContainerConfig {
        self.config
    }
}
