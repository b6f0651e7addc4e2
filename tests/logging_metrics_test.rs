//! 日志系统、指标与错误事件集成测试

use std::sync::Arc;

use chips_container::{
    error_code, ActivatorRegistry, ContainerConfig, CoreError, LifecycleEventKind, Logger,
    LoggerConfig, ModuleContainer, ModuleDescriptor, ModuleSource, ModuleState, RotationStrategy,
};
use tempfile::TempDir;

// ============================================================================
// 日志系统
// ============================================================================

/// 测试从容器配置生成日志配置
#[test]
fn test_logger_config_from_container_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = ContainerConfig::builder()
        .log_level("debug")
        .file_logging(temp_dir.path())
        .json_logging()
        .build();

    let logger_config = LoggerConfig::from_log_config(&config.logging);
    assert_eq!(logger_config.level, "debug");
    assert!(logger_config.json_format);
    assert_eq!(logger_config.file_output.as_deref(), Some(temp_dir.path()));
    assert_eq!(logger_config.rotation, RotationStrategy::Daily);
}

/// 测试重复初始化返回空守卫而不是失败
#[test]
fn test_logger_try_init_is_repeatable() {
    let config = LoggerConfig::builder()
        .level("warn")
        .console_output(false)
        .build();
    let _first = Logger::try_init(config.clone());
    let second = Logger::try_init(config);
    assert_eq!(second.writer_count(), 0);
}

// ============================================================================
// 指标
// ============================================================================

/// 测试生命周期操作计入指标
#[tokio::test]
async fn test_metrics_track_lifecycle() {
    let container = ModuleContainer::new(ContainerConfig::default(), Arc::new(ActivatorRegistry::new()))
        .await
        .unwrap();
    let module = container
        .install(
            "mem:a",
            ModuleSource::Descriptor(ModuleDescriptor::new("chips.a", "1.0.0")),
        )
        .await
        .unwrap();

    container.start(module.id(), false).await.unwrap();
    container.stop(module.id(), false).await.unwrap();
    container
        .update(
            module.id(),
            ModuleSource::Descriptor(ModuleDescriptor::new("chips.a", "1.0.1")),
        )
        .await
        .unwrap();
    container.uninstall(module.id()).await.unwrap();

    let metrics = container.metrics();
    assert_eq!(metrics.starts, 1);
    assert_eq!(metrics.stops, 1);
    assert_eq!(metrics.updates, 1);
    assert_eq!(metrics.uninstalls, 1);
    assert_eq!(metrics.rollbacks, 0);
    assert_eq!(metrics.lock_timeouts, 0);

    let json = serde_json::to_value(&metrics).unwrap();
    assert_eq!(json["starts"], 1);
}

// ============================================================================
// 错误事件
// ============================================================================

/// 更新成功但重启失败：调用方得到成功，失败通过错误事件上报
#[tokio::test]
async fn test_restart_failure_is_published_not_returned() {
    let container = ModuleContainer::new(ContainerConfig::default(), Arc::new(ActivatorRegistry::new()))
        .await
        .unwrap();
    let module = container
        .install(
            "mem:a",
            ModuleSource::Descriptor(ModuleDescriptor::new("chips.a", "1.0.0")),
        )
        .await
        .unwrap();
    container.start(module.id(), false).await.unwrap();
    let mut errors = container.subscribe_pattern("module.error");
    let mut lifecycle = container.subscribe();

    container
        .update(
            module.id(),
            ModuleSource::Descriptor(
                ModuleDescriptor::new("chips.a", "2.0.0").with_activator("not-registered"),
            ),
        )
        .await
        .unwrap();

    assert_eq!(module.state(), ModuleState::Resolved);
    let errors = errors.drain();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_error());
    assert_eq!(errors[0].module_id, module.id());

    let kinds: Vec<_> = lifecycle
        .drain()
        .iter()
        .filter_map(|e| e.lifecycle_kind())
        .collect();
    assert!(kinds.contains(&LifecycleEventKind::Updated));
    assert!(!kinds.contains(&LifecycleEventKind::Started));
}

/// 测试错误码
#[test]
fn test_error_codes() {
    let err = CoreError::StorageFailed("disk".to_string());
    assert_eq!(err.error_code(), error_code::STORAGE_FAILED);
    assert!(CoreError::uninstalled(3).is_illegal_state());
    assert!(CoreError::StateChangeTimeout {
        module_id: 3,
        waited_ms: 5000
    }
    .is_lock_timeout());
}
