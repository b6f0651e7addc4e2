//! 日志系统
//!
//! 基于 tracing 生态初始化容器日志：
//!
//! - 级别与模块过滤（EnvFilter，`RUST_LOG` 优先）
//! - 控制台或文件输出，文件输出异步非阻塞并按时间轮转
//! - 可读格式或 JSON 结构化格式
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_container::utils::logger::{Logger, LoggerConfig, RotationStrategy};
//!
//! let _guard = Logger::init(
//!     LoggerConfig::builder()
//!         .level("debug")
//!         .file_output("./logs")
//!         .rotation(RotationStrategy::Daily)
//!         .build(),
//! )
//! .unwrap();
//!
//! tracing::info!(module_id = 3, state = "ACTIVE", "模块已启动");
//! ```

use crate::utils::{CoreError, Result};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// 默认日志文件名前缀
pub const DEFAULT_FILE_PREFIX: &str = "chips-container";

// ============================================================================
// 日志轮转策略
// ============================================================================

/// 日志文件轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转
    Never,
    /// 每分钟轮转（主要用于测试）
    Minutely,
    /// 每小时轮转
    Hourly,
    /// 每天轮转
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Minutely => Rotation::MINUTELY,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 从配置字符串解析，无法识别时退回每天轮转
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "minutely" | "minute" => RotationStrategy::Minutely,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RotationStrategy::Never => "never",
            RotationStrategy::Minutely => "minutely",
            RotationStrategy::Hourly => "hourly",
            RotationStrategy::Daily => "daily",
        };
        f.write_str(name)
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别
    pub level: String,
    /// 是否使用 JSON 格式
    pub json_format: bool,
    /// 是否输出到控制台
    pub console_output: bool,
    /// 文件输出目录（None 表示不写文件）
    pub file_output: Option<PathBuf>,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 轮转策略
    pub rotation: RotationStrategy,
    /// 保留的最大日志文件数
    pub max_files: usize,
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_file_line: bool,
    pub show_level: bool,
    /// 附加过滤指令（EnvFilter 格式），例如 "chips_container::module::coordinator=trace"
    pub filter_directives: Option<String>,
    /// 控制台是否使用 ANSI 颜色
    pub ansi_colors: bool,
    /// 是否记录 span 关闭事件（可用于观察每次状态转换的耗时）
    pub span_close_events: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            rotation: RotationStrategy::Daily,
            max_files: 7,
            show_target: true,
            show_thread_ids: false,
            show_file_line: false,
            show_level: true,
            filter_directives: None,
            ansi_colors: true,
            span_close_events: false,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::default()
    }

    /// 从容器配置中的日志段创建
    pub fn from_log_config(log_config: &crate::core::config::LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                log_config.log_dir.clone()
            } else {
                None
            },
            rotation: RotationStrategy::parse(&log_config.rotation),
            max_files: log_config.max_files,
            ..Default::default()
        }
    }

    /// 解析日志级别，无法识别时为 INFO
    pub fn parse_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_close_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    pub fn max_files(mut self, count: usize) -> Self {
        self.config.max_files = count;
        self
    }

    pub fn show_target(mut self, enable: bool) -> Self {
        self.config.show_target = enable;
        self
    }

    pub fn show_thread_ids(mut self, enable: bool) -> Self {
        self.config.show_thread_ids = enable;
        self
    }

    pub fn show_file_line(mut self, enable: bool) -> Self {
        self.config.show_file_line = enable;
        self
    }

    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    pub fn span_close_events(mut self, enable: bool) -> Self {
        self.config.span_close_events = enable;
        self
    }

    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

// ============================================================================
// 日志守卫
// ============================================================================

/// 日志系统守卫
///
/// 持有非阻塞写入器的 `WorkerGuard`，丢弃时会刷新尚未写出的日志，
/// 因此必须保持到进程退出。
#[derive(Default)]
pub struct LogGuard {
    guards: Vec<WorkerGuard>,
}

impl LogGuard {
    /// 持有的写入器数量
    pub fn writer_count(&self) -> usize {
        self.guards.len()
    }
}

// ============================================================================
// 日志系统
// ============================================================================

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化全局日志订阅者
    ///
    /// # Arguments
    ///
    /// * `config` - 日志配置
    ///
    /// # Returns
    ///
    /// 返回 `LogGuard`，必须保持到程序退出
    ///
    /// # Errors
    ///
    /// 重复初始化或全局订阅者已被其他代码设置时返回 `InitFailed`
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(CoreError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let env_filter = Self::create_env_filter(&config);
        let mut guard = LogGuard::default();

        let console_layer = if config.console_output {
            let (writer, worker) = tracing_appender::non_blocking(io::stdout());
            guard.guards.push(worker);
            Some(Self::fmt_layer(&config, writer, config.ansi_colors))
        } else {
            None
        };

        let file_layer = match config.file_output {
            Some(ref log_dir) => {
                let appender = RollingFileAppender::new(
                    config.rotation.to_rotation(),
                    log_dir,
                    format!("{}.log", config.file_prefix),
                );
                let (writer, worker) = tracing_appender::non_blocking(appender);
                guard.guards.push(worker);
                Some(Self::fmt_layer(&config, writer, false))
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| CoreError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(());
        Ok(guard)
    }

    /// 尝试初始化日志系统，已初始化时返回空守卫
    ///
    /// 测试中可以反复调用。
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_default()
    }

    /// 创建过滤器：`RUST_LOG` 优先，其次是配置的级别加附加指令
    ///
    /// 无法解析的附加指令会被忽略。
    fn create_env_filter(config: &LoggerConfig) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.parse_level().to_string().to_lowercase()));

        match config.filter_directives {
            Some(ref directives) => directives
                .split(',')
                .filter_map(|d| d.trim().parse().ok())
                .fold(filter, |f, directive| f.add_directive(directive)),
            None => filter,
        }
    }

    fn fmt_layer<S>(
        config: &LoggerConfig,
        writer: NonBlocking,
        ansi: bool,
    ) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_level(config.show_level)
            .with_span_events(config.span_events());

        if config.json_format {
            layer.json().with_ansi(false).boxed()
        } else {
            layer.with_ansi(ansi).boxed()
        }
    }
}

// ============================================================================
// 结构化日志字段
// ============================================================================

/// 标准日志字段名称
pub mod fields {
    /// 模块 ID
    pub const MODULE_ID: &str = "module_id";
    /// 宿主模块 ID（片段重定向时）
    pub const HOST_ID: &str = "host_id";
    /// 模块位置
    pub const LOCATION: &str = "location";
    pub const SYMBOLIC_NAME: &str = "symbolic_name";
    pub const VERSION: &str = "version";
    /// 当前状态
    pub const STATE: &str = "state";
    /// 生命周期操作（start/stop/update/uninstall ...）
    pub const OPERATION: &str = "operation";
    pub const START_LEVEL: &str = "start_level";
    pub const ERROR_CODE: &str = "error_code";
    pub const ERROR: &str = "error";
    pub const EVENT_KIND: &str = "event_kind";
    pub const EVENT_ID: &str = "event_id";
    /// 锁等待耗时（微秒）
    pub const WAITED_US: &str = "waited_us";
}

// ============================================================================
// 便捷宏
// ============================================================================

/// 创建状态转换 span
///
/// ```rust,ignore
/// let span = chips_container::transition_span!("start", module.id());
/// ```
#[macro_export]
macro_rules! transition_span {
    ($operation:expr, $module_id:expr) => {
        tracing::info_span!(
            "transition",
            operation = %$operation,
            module_id = $module_id
        )
    };
}

/// 记录被吞掉的次要失败（回滚或重启失败）
#[macro_export]
macro_rules! log_contained_failure {
    ($module_id:expr, $operation:expr, $error:expr) => {
        tracing::error!(
            module_id = $module_id,
            operation = %$operation,
            error = %$error,
            "次要失败已通过事件上报，不向调用方传播"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_parse() {
        assert_eq!(RotationStrategy::parse("HOURLY"), RotationStrategy::Hourly);
        assert_eq!(RotationStrategy::parse("none"), RotationStrategy::Never);
        assert_eq!(RotationStrategy::parse("bogus"), RotationStrategy::Daily);
        assert_eq!(RotationStrategy::Minutely.to_string(), "minutely");
    }

    #[test]
    fn test_logger_config_default() {
        let config = LoggerConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.file_prefix, DEFAULT_FILE_PREFIX);
        assert!(config.console_output);
        assert!(config.file_output.is_none());
        assert!(!config.json_format);
    }

    #[test]
    fn test_logger_config_builder() {
        let config = LoggerConfig::builder()
            .level("debug")
            .json_format(true)
            .file_output("/var/log/chips")
            .rotation(RotationStrategy::Hourly)
            .max_files(14)
            .filter_directives("chips_container::module=trace")
            .span_close_events(true)
            .build();

        assert_eq!(config.parse_level(), Level::DEBUG);
        assert!(config.json_format);
        assert_eq!(config.file_output, Some(PathBuf::from("/var/log/chips")));
        assert_eq!(config.rotation, RotationStrategy::Hourly);
        assert_eq!(config.max_files, 14);
        assert_eq!(config.span_events(), FmtSpan::CLOSE);
    }

    #[test]
    fn test_parse_level_fallback() {
        let config = LoggerConfig::builder().level("loud").build();
        assert_eq!(config.parse_level(), Level::INFO);
        let config = LoggerConfig::builder().level("WARNING").build();
        assert_eq!(config.parse_level(), Level::WARN);
    }

    #[test]
    fn test_from_log_config() {
        use crate::core::config::LogConfig;

        let log_config = LogConfig {
            level: "warn".to_string(),
            file_output: false,
            log_dir: Some(PathBuf::from("/var/log")),
            json_format: true,
            rotation: "never".to_string(),
            max_files: 3,
        };

        let config = LoggerConfig::from_log_config(&log_config);
        assert_eq!(config.level, "warn");
        assert!(config.json_format);
        // file_output=false 时忽略目录
        assert!(config.file_output.is_none());
        assert_eq!(config.rotation, RotationStrategy::Never);
    }

    #[test]
    fn test_env_filter_ignores_bad_directives() {
        let config = LoggerConfig::builder()
            .filter_directives("chips_container=debug,=== ,")
            .build();
        let _ = Logger::create_env_filter(&config);
    }

    #[test]
    fn test_try_init_never_fails() {
        let _guard = Logger::try_init(LoggerConfig::builder().console_output(false).build());
        let guard = Logger::try_init(LoggerConfig::default());
        assert_eq!(guard.writer_count(), 0);
    }
}
