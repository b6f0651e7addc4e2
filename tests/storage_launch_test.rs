//! # 持久化与启动集成测试
//!
//! 使用数据目录的文件存储，测试容器重启后模块、自动启动标志和启动级别的恢复。

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chips_container::{
    ActivatorRegistry, ContainerConfig, LifecycleEventKind, ModuleActivator, ModuleContainer,
    ModuleContext, ModuleState,
};
use tempfile::TempDir;

#[derive(Default)]
struct CountingActivator {
    starts: AtomicUsize,
}

#[async_trait]
impl ModuleActivator for CountingActivator {
    async fn start(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn write_module(dir: &Path, name: &str, yaml: &str) -> std::path::PathBuf {
    let module_dir = dir.join(name);
    tokio::fs::create_dir_all(&module_dir).await.unwrap();
    tokio::fs::write(module_dir.join("module.yaml"), yaml).await.unwrap();
    module_dir
}

async fn open(data_dir: &Path, counter: Arc<CountingActivator>) -> ModuleContainer {
    open_with(ContainerConfig::builder().data_dir(data_dir).build(), counter).await
}

async fn open_with(config: ContainerConfig, counter: Arc<CountingActivator>) -> ModuleContainer {
    let activators = ActivatorRegistry::new();
    activators.register_shared("counter", counter);
    ModuleContainer::new(config, Arc::new(activators)).await.unwrap()
}

const EDITOR_YAML: &str = r#"
symbolic_name: chips.editor
version: 1.0.0
activator: counter
"#;

const VIEWER_YAML: &str = r#"
symbolic_name: chips.viewer
version: 1.0.0
activator: counter
"#;

#[tokio::test]
async fn test_auto_start_survives_restart() {
    let data = TempDir::new().unwrap();
    let sources = TempDir::new().unwrap();
    let editor_dir = write_module(sources.path(), "editor", EDITOR_YAML).await;
    let viewer_dir = write_module(sources.path(), "viewer", VIEWER_YAML).await;

    {
        let counter = Arc::new(CountingActivator::default());
        let container = open(data.path(), counter.clone()).await;
        let editor = container.install_dir(&editor_dir).await.unwrap();
        let viewer = container.install_dir(&viewer_dir).await.unwrap();
        container.start(editor.id(), true).await.unwrap();
        container.start(viewer.id(), false).await.unwrap();
        assert_eq!(counter.starts.load(Ordering::SeqCst), 2);
    }

    let counter = Arc::new(CountingActivator::default());
    let container = open(data.path(), counter.clone()).await;
    let mut events = container.subscribe_pattern("module.started");
    let report = container.launch().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.succeeded, vec![1]);
    assert_eq!(counter.starts.load(Ordering::SeqCst), 1);
    assert_eq!(container.module_state(1).await, Some(ModuleState::Active));
    assert_eq!(container.module_state(2).await, Some(ModuleState::Installed));
    assert_eq!(events.drain().len(), 1);
}

#[tokio::test]
async fn test_persistent_stop_clears_auto_start() {
    let data = TempDir::new().unwrap();
    let sources = TempDir::new().unwrap();
    let editor_dir = write_module(sources.path(), "editor", EDITOR_YAML).await;

    {
        let container = open(data.path(), Arc::default()).await;
        let editor = container.install_dir(&editor_dir).await.unwrap();
        container.start(editor.id(), true).await.unwrap();
        container.stop(editor.id(), true).await.unwrap();
    }

    let counter = Arc::new(CountingActivator::default());
    let container = open(data.path(), counter.clone()).await;
    let report = container.launch().await.unwrap();
    assert!(report.succeeded.is_empty());
    assert_eq!(counter.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ids_are_never_reused_across_restart() {
    let data = TempDir::new().unwrap();
    let sources = TempDir::new().unwrap();
    let editor_dir = write_module(sources.path(), "editor", EDITOR_YAML).await;
    let viewer_dir = write_module(sources.path(), "viewer", VIEWER_YAML).await;

    {
        let container = open(data.path(), Arc::default()).await;
        container.install_dir(&editor_dir).await.unwrap();
        let viewer = container.install_dir(&viewer_dir).await.unwrap();
        container.uninstall(viewer.id()).await.unwrap();
    }

    let container = open(data.path(), Arc::default()).await;
    container.launch().await.unwrap();
    assert_eq!(container.module_count().await, 1);
    let viewer = container.install_dir(&viewer_dir).await.unwrap();
    assert_eq!(viewer.id(), 3);
}

#[tokio::test]
async fn test_start_level_limits_launch() {
    let data = TempDir::new().unwrap();
    let sources = TempDir::new().unwrap();
    let editor_dir = write_module(sources.path(), "editor", EDITOR_YAML).await;
    let viewer_dir = write_module(sources.path(), "viewer", VIEWER_YAML).await;

    {
        let container = open(data.path(), Arc::default()).await;
        let editor = container.install_dir(&editor_dir).await.unwrap();
        let viewer = container.install_dir(&viewer_dir).await.unwrap();
        container.set_module_start_level(viewer.id(), 4).await.unwrap();
        container.start(editor.id(), true).await.unwrap();
        container.start(viewer.id(), true).await.unwrap();
    }

    let config = ContainerConfig::builder()
        .data_dir(data.path())
        .active_start_level(2)
        .build();
    let counter = Arc::new(CountingActivator::default());
    let container = open_with(config, counter.clone()).await;
    let report = container.launch().await.unwrap();

    assert_eq!(report.succeeded, vec![1]);
    let viewer = container.get_module(2).await.unwrap();
    assert_eq!(viewer.start_level(), 4);
    assert!(viewer.is_auto_start());
    assert_eq!(viewer.state(), ModuleState::Installed);
}

#[tokio::test]
async fn test_update_from_directory_keeps_id() {
    let data = TempDir::new().unwrap();
    let sources = TempDir::new().unwrap();
    let editor_dir = write_module(sources.path(), "editor", EDITOR_YAML).await;

    let counter = Arc::new(CountingActivator::default());
    let container = open(data.path(), counter.clone()).await;
    let editor = container.install_dir(&editor_dir).await.unwrap();
    container.start(editor.id(), true).await.unwrap();

    tokio::fs::write(
        editor_dir.join("module.yaml"),
        EDITOR_YAML.replace("1.0.0", "1.2.0"),
    )
    .await
    .unwrap();
    let mut events = container.subscribe();
    container.update_from_location(editor.id()).await.unwrap();

    assert_eq!(editor.version().to_string(), "1.2.0");
    assert_eq!(editor.state(), ModuleState::Active);
    assert!(events
        .drain()
        .iter()
        .any(|e| e.lifecycle_kind() == Some(LifecycleEventKind::Updated)));
    drop(container);

    let container = open(data.path(), Arc::default()).await;
    container.load_persisted().await.unwrap();
    let reloaded = container.get_module(editor.id()).await.unwrap();
    assert_eq!(reloaded.version().to_string(), "1.2.0");
    assert_eq!(reloaded.revision().generation, 1);
    assert!(reloaded.is_auto_start());
}

#[tokio::test]
async fn test_install_from_directory_without_descriptor_fails() {
    let data = TempDir::new().unwrap();
    let empty = TempDir::new().unwrap();
    let container = open(data.path(), Arc::default()).await;

    let err = container.install_dir(empty.path()).await.unwrap_err();
    assert!(matches!(err, chips_container::CoreError::InvalidMetadata(_)));
    assert_eq!(container.module_count().await, 0);
}
