//! Chips Container 命令行入口
//!
//! 管理数据目录中持久化的模块。每条命令都会打开数据目录、加载已安装的模块，
//! 执行一次操作后退出。
//!
//! # 命令概览
//!
//! - `install` - 从目录安装模块
//! - `list` - 列出已安装的模块
//! - `start` / `stop` - 启动或停止模块（持久记录自动启动标志）
//! - `update` - 更新模块内容
//! - `uninstall` - 卸载模块
//! - `launch` - 启动全部自动启动模块
//! - `check-config` - 验证配置文件
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! # 安装模块
//! chips-container --data-dir ./data install ./modules/editor
//!
//! # 列出模块
//! chips-container --data-dir ./data list
//!
//! # 从新目录更新模块 1
//! chips-container --data-dir ./data update 1 --path ./modules/editor-2
//! ```
//!
//! 命令行工具不注册任何激活器，声明了激活器的模块需要由嵌入容器的程序启动。

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use chips_container::{
    ActivatorRegistry, BatchReport, ContainerConfig, LogGuard, Logger, LoggerConfig,
    ModuleContainer, ModuleId, ModuleSource,
};

/// Chips Container - 薯片模块容器
#[derive(Parser)]
#[command(name = "chips-container")]
#[command(version, about = "薯片动态模块容器", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// 数据目录，覆盖配置文件中的 storage.data_dir
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 子命令
    #[command(subcommand)]
    command: Commands,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 从目录安装模块
    ///
    /// 目录中需要包含 module.yaml 或 module.json。
    Install {
        /// 模块目录
        path: PathBuf,
    },

    /// 列出已安装的模块
    List {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },

    /// 启动模块，并记录为自动启动
    Start {
        id: ModuleId,
        /// 只启动本次，不记录自动启动标志
        #[arg(long)]
        transient: bool,
    },

    /// 停止模块，并清除自动启动标志
    Stop {
        id: ModuleId,
        /// 只停止本次，不清除自动启动标志
        #[arg(long)]
        transient: bool,
    },

    /// 更新模块内容
    ///
    /// 不指定 --path 时从安装位置重新读取。
    Update {
        id: ModuleId,
        /// 新的模块目录
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// 卸载模块
    Uninstall { id: ModuleId },

    /// 设置模块启动级别
    StartLevel { id: ModuleId, level: i32 },

    /// 启动全部自动启动模块
    Launch,

    /// 验证配置文件
    CheckConfig,

    /// 查看版本信息
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            print_version();
            return Ok(());
        }
        Commands::CheckConfig => {
            return check_config(&cli.config).await;
        }
        _ => {}
    }

    let config = load_config(&cli).await?;
    let _guard = init_logging(&config, cli.log_level.as_deref());

    let container = ModuleContainer::new(config, Arc::new(ActivatorRegistry::new())).await?;
    let loaded = container.load_persisted().await?;
    debug!(loaded, "数据目录已加载");

    match cli.command {
        Commands::Install { path } => {
            let module = container.install_dir(&path).await?;
            println!(
                "已安装模块 [{}] {} {}",
                module.id(),
                module.symbolic_name().unwrap_or_default(),
                module.version()
            );
        }
        Commands::List { json } => list_modules(&container, json).await?,
        Commands::Start { id, transient } => {
            container.start(id, !transient).await?;
            println!("模块 [{}] 已启动", id);
        }
        Commands::Stop { id, transient } => {
            container.stop(id, !transient).await?;
            println!("模块 [{}] 已停止", id);
        }
        Commands::Update { id, path } => {
            match path {
                Some(path) => container.update(id, ModuleSource::Directory(path)).await?,
                None => container.update_from_location(id).await?,
            }
            let pending = container.pending_refresh().await;
            println!("模块 [{}] 已更新", id);
            if !pending.is_empty() {
                println!("等待刷新的模块: {:?}", pending);
            }
        }
        Commands::Uninstall { id } => {
            container.uninstall(id).await?;
            println!("模块 [{}] 已卸载", id);
        }
        Commands::StartLevel { id, level } => {
            container.set_module_start_level(id, level).await?;
            println!("模块 [{}] 启动级别设为 {}", id, level);
        }
        Commands::Launch => {
            let report = container.launch().await?;
            print_report(&report);
        }
        Commands::CheckConfig | Commands::Version => {}
    }

    Ok(())
}

/// 加载配置文件，命令行参数覆盖文件中的值
async fn load_config(cli: &Cli) -> Result<ContainerConfig, Box<dyn std::error::Error>> {
    let mut config = if cli.config.exists() {
        ContainerConfig::from_file(&cli.config).await?
    } else {
        ContainerConfig::default()
    };
    if let Some(ref dir) = cli.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    if config.storage.data_dir.is_none() {
        return Err("需要通过 --data-dir 或配置文件指定数据目录".into());
    }
    Ok(config)
}

/// 初始化日志系统，命令行指定的级别优先
fn init_logging(config: &ContainerConfig, level: Option<&str>) -> LogGuard {
    let mut logger_config = LoggerConfig::from_log_config(&config.logging);
    if let Some(level) = level {
        logger_config.level = level.to_string();
    }
    let guard = Logger::try_init(logger_config);
    info!(data_dir = ?config.storage.data_dir, "日志系统已初始化");
    guard
}

async fn list_modules(
    container: &ModuleContainer,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let modules = container.list_modules().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&modules)?);
        return Ok(());
    }
    if modules.is_empty() {
        println!("没有已安装的模块");
        return Ok(());
    }
    println!("{:<6} {:<12} {:<6} {:<30} {:<10} 位置", "ID", "状态", "级别", "名称", "版本");
    for info in modules {
        println!(
            "{:<6} {:<12} {:<6} {:<30} {:<10} {}",
            info.id,
            info.state.as_str(),
            info.start_level,
            info.symbolic_name.unwrap_or_else(|| "-".to_string()),
            info.version,
            info.location
        );
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    println!("已启动: {:?}", report.succeeded);
    for (id, error) in &report.failed {
        println!("模块 [{}] 启动失败: {}", id, error);
    }
}

/// 检查配置文件
async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());

    if !path.exists() {
        println!("配置文件不存在，将使用默认配置");
        println!("{}", serde_yaml::to_string(&ContainerConfig::default())?);
        return Ok(());
    }

    match ContainerConfig::from_file(path).await {
        Ok(config) => {
            println!("配置文件有效");
            println!("────────────────────────────────────────");
            println!("  状态变更等待上限: {} ms", config.lifecycle.state_change_timeout_ms);
            println!("  默认启动级别:     {}", config.lifecycle.default_start_level);
            println!("  活动启动级别:     {}", config.lifecycle.active_start_level);
            if let Some(ref dir) = config.storage.data_dir {
                println!("  数据目录:         {}", dir.display());
            }
            println!(
                "  权限检查:         {}",
                if config.security.enabled { "启用" } else { "禁用" }
            );
            println!("  日志级别:         {}", config.logging.level);
            println!("────────────────────────────────────────");
            Ok(())
        }
        Err(e) => {
            println!("配置文件无效: {}", e);
            Err(Box::new(e))
        }
    }
}

fn print_version() {
    println!("Chips Container - 薯片模块容器");
    println!("  版本:     {}", chips_container::VERSION);
    println!("  目标平台: {}", std::env::consts::ARCH);
    println!("  操作系统: {}", std::env::consts::OS);
}
