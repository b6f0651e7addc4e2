//! 薯片模块容器错误类型定义
//!
//! 本模块定义了容器中使用的所有错误类型。

use thiserror::Error;

/// 模块激活器等外部协作者返回的原始错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 容器核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 生命周期错误 ====================

    /// 非法状态：模块已卸载，或当前状态不允许该操作
    #[error("非法状态: 模块 {module_id} - {reason}")]
    IllegalState {
        module_id: u64,
        reason: String,
    },

    /// 同一任务重入模块的状态变更
    #[error("非法状态: 模块 {module_id} 的状态变更已由当前任务持有，不能重入")]
    ReentrantStateChange {
        module_id: u64,
    },

    /// 等待状态变更锁超时
    #[error("等待模块 {module_id} 的状态变更超时 ({waited_ms}ms)")]
    StateChangeTimeout {
        module_id: u64,
        waited_ms: u64,
    },

    /// 依赖解析或权限检查失败
    #[error("模块 {module_id} 无法解析: {reason}")]
    ResolutionFailed {
        module_id: u64,
        reason: String,
    },

    /// 模块激活器启动或停止失败
    #[error("模块 {module_id} 的激活器出错: {source}")]
    ActivationFailed {
        module_id: u64,
        #[source]
        source: BoxError,
    },

    // ==================== 存储与注册表错误 ====================

    /// 持久化事务失败
    #[error("持久化存储失败: {0}")]
    StorageFailed(String),

    /// 符号名和版本与另一个已安装模块冲突
    #[error("模块冲突: {symbolic_name}@{version} 已由模块 {existing_id} 安装")]
    ModuleConflict {
        symbolic_name: String,
        version: String,
        existing_id: u64,
    },

    /// 权限被拒绝
    #[error("权限被拒绝: {0}")]
    PermissionDenied(String),

    /// 模块未找到
    #[error("模块未找到: {0}")]
    ModuleNotFound(u64),

    /// 无效的模块描述
    #[error("无效的模块描述: {0}")]
    InvalidMetadata(String),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 容器操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 生命周期错误 (LIFECYCLE-xxx)
    pub const LIFECYCLE_ILLEGAL_STATE: &str = "LIFECYCLE-001";
    pub const LIFECYCLE_REENTRANT: &str = "LIFECYCLE-002";
    pub const LIFECYCLE_LOCK_TIMEOUT: &str = "LIFECYCLE-003";
    pub const LIFECYCLE_ACTIVATOR: &str = "LIFECYCLE-004";

    // 模块错误 (MODULE-xxx)
    pub const MODULE_NOT_FOUND: &str = "MODULE-001";
    pub const MODULE_UNRESOLVED: &str = "MODULE-002";
    pub const MODULE_CONFLICT: &str = "MODULE-003";
    pub const MODULE_INVALID_METADATA: &str = "MODULE-004";

    // 存储错误 (STORAGE-xxx)
    pub const STORAGE_FAILED: &str = "STORAGE-001";
    pub const STORAGE_IO: &str = "STORAGE-002";

    // 权限错误 (PERMISSION-xxx)
    pub const PERMISSION_DENIED: &str = "PERMISSION-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 其他
    pub const INTERNAL: &str = "CORE-001";
    pub const UNKNOWN: &str = "UNKNOWN";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::IllegalState { .. } => error_code::LIFECYCLE_ILLEGAL_STATE,
            CoreError::ReentrantStateChange { .. } => error_code::LIFECYCLE_REENTRANT,
            CoreError::StateChangeTimeout { .. } => error_code::LIFECYCLE_LOCK_TIMEOUT,
            CoreError::ActivationFailed { .. } => error_code::LIFECYCLE_ACTIVATOR,
            CoreError::ResolutionFailed { .. } => error_code::MODULE_UNRESOLVED,
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::ModuleConflict { .. } => error_code::MODULE_CONFLICT,
            CoreError::InvalidMetadata(_) => error_code::MODULE_INVALID_METADATA,
            CoreError::StorageFailed(_) => error_code::STORAGE_FAILED,
            CoreError::Io(_) => error_code::STORAGE_IO,
            CoreError::PermissionDenied(_) => error_code::PERMISSION_DENIED,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CoreError::Internal(_) | CoreError::InitFailed(_) => error_code::INTERNAL,
            _ => error_code::UNKNOWN,
        }
    }

    /// 是否属于非法状态类错误（已卸载或重入）
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            CoreError::IllegalState { .. } | CoreError::ReentrantStateChange { .. }
        )
    }

    /// 是否为状态变更锁超时
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, CoreError::StateChangeTimeout { .. })
    }

    /// 模块已卸载时的标准错误
    pub fn uninstalled(module_id: u64) -> Self {
        CoreError::IllegalState {
            module_id,
            reason: "模块已卸载".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::StateChangeTimeout {
            module_id: 7,
            waited_ms: 5000,
        };
        assert!(err.to_string().contains("5000"));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_error_code() {
        assert_eq!(
            CoreError::uninstalled(1).error_code(),
            error_code::LIFECYCLE_ILLEGAL_STATE
        );
        assert_eq!(
            CoreError::ReentrantStateChange { module_id: 1 }.error_code(),
            error_code::LIFECYCLE_REENTRANT
        );
        assert_eq!(
            CoreError::StorageFailed("disk".into()).error_code(),
            error_code::STORAGE_FAILED
        );
    }

    #[test]
    fn test_classification() {
        assert!(CoreError::uninstalled(1).is_illegal_state());
        assert!(CoreError::ReentrantStateChange { module_id: 1 }.is_illegal_state());
        assert!(!CoreError::ModuleNotFound(1).is_illegal_state());
        assert!(CoreError::StateChangeTimeout {
            module_id: 1,
            waited_ms: 1
        }
        .is_lock_timeout());
    }

    #[test]
    fn test_activation_failure_keeps_cause() {
        use std::error::Error as _;

        let cause: BoxError = anyhow::anyhow!("activator exploded").into();
        let err = CoreError::ActivationFailed {
            module_id: 3,
            source: cause,
        };
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("activator exploded"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();
        assert!(matches!(core_err, CoreError::Io(_)));
    }
}
