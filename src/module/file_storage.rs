//! 文件存储
//!
//! 目录结构：
//!
//! ```text
//! <data_dir>/
//!   next_id                     下一个可分配的模块 ID
//!   modules/<id>/
//!     state.json                位置、代数、标志位、启动级别
//!     gen-<n>/module.json       第 n 代模块描述
//!     .tombstone                已卸载但内容仍被使用，下次加载时清理
//! ```
//!
//! `state.json` 通过临时文件加重命名写入，它指向的代数就是当前内容。
//! 旧代内容仍被使用时保留，下次 [`load_all`](ModuleStorage::load_all) 时清理。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::module::metadata::{ModuleDescriptor, PersistentFlags};
use crate::module::storage::{
    ModuleSource, ModuleStorage, PersistentRecord, StagedRecord, StorageOperation,
};
use crate::utils::{CoreError, ModuleId, Result};

const MODULES_DIR: &str = "modules";
const STATE_FILE: &str = "state.json";
const DESCRIPTOR_FILE: &str = "module.json";
const TOMBSTONE_FILE: &str = ".tombstone";
const NEXT_ID_FILE: &str = "next_id";

/// state.json 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StateFile {
    id: ModuleId,
    location: String,
    generation: u64,
    #[serde(default)]
    flags: PersistentFlags,
    start_level: i32,
}

/// 文件存储
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// 打开（必要时创建）数据目录
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let root = data_dir.into();
        tokio::fs::create_dir_all(root.join(MODULES_DIR))
            .await
            .map_err(|e| storage_error(&root, e))?;
        info!(data_dir = %root.display(), "打开模块文件存储");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn module_dir(&self, id: ModuleId) -> PathBuf {
        self.root.join(MODULES_DIR).join(id.to_string())
    }

    fn layout(&self, id: ModuleId) -> ModuleLayout {
        ModuleLayout {
            dir: self.module_dir(id),
        }
    }
}

fn storage_error(path: &Path, e: impl std::fmt::Display) -> CoreError {
    CoreError::StorageFailed(format!("{}: {}", path.display(), e))
}

/// 单个模块的目录布局
#[derive(Debug, Clone)]
struct ModuleLayout {
    dir: PathBuf,
}

impl ModuleLayout {
    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn generation_dir(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("gen-{}", generation))
    }

    fn tombstone_path(&self) -> PathBuf {
        self.dir.join(TOMBSTONE_FILE)
    }

    async fn read_state(&self) -> Result<StateFile> {
        let path = self.state_path();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| storage_error(&path, e))?;
        serde_json::from_str(&content).map_err(|e| storage_error(&path, e))
    }

    async fn write_state(&self, state: &StateFile) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.state_path(), &content).await
    }

    async fn read_descriptor(&self, generation: u64) -> Result<ModuleDescriptor> {
        let path = self.generation_dir(generation).join(DESCRIPTOR_FILE);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| storage_error(&path, e))?;
        serde_json::from_str(&content).map_err(|e| storage_error(&path, e))
    }

    async fn write_descriptor(&self, generation: u64, descriptor: &ModuleDescriptor) -> Result<()> {
        let dir = self.generation_dir(generation);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error(&dir, e))?;
        let content = serde_json::to_vec_pretty(descriptor)?;
        write_atomic(&dir.join(DESCRIPTOR_FILE), &content).await
    }

    async fn remove_generation(&self, generation: u64) {
        let dir = self.generation_dir(generation);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(path = %dir.display(), error = %e, "清理旧代内容失败");
        }
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| storage_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| storage_error(path, e))
}

#[async_trait]
impl ModuleStorage for FileStorage {
    fn install_module(
        &self,
        id: ModuleId,
        location: &str,
        source: ModuleSource,
        start_level: i32,
    ) -> Box<dyn StorageOperation> {
        Box::new(InstallOperation {
            layout: self.layout(id),
            id,
            location: location.to_string(),
            source,
            start_level,
            staged: None,
        })
    }

    fn update_module(&self, id: ModuleId, source: ModuleSource) -> Box<dyn StorageOperation> {
        Box::new(UpdateOperation {
            layout: self.layout(id),
            source,
            previous: None,
            staged: None,
            committed: false,
        })
    }

    fn uninstall_module(&self, id: ModuleId) -> Box<dyn StorageOperation> {
        Box::new(UninstallOperation {
            layout: self.layout(id),
            previous: None,
            committed: false,
        })
    }

    async fn save_module_state(
        &self,
        id: ModuleId,
        flags: PersistentFlags,
        start_level: i32,
    ) -> Result<()> {
        let layout = self.layout(id);
        let mut state = layout.read_state().await?;
        state.flags = flags;
        state.start_level = start_level;
        layout.write_state(&state).await
    }

    async fn load_all(&self) -> Result<Vec<PersistentRecord>> {
        let modules_dir = self.root.join(MODULES_DIR);
        let mut entries = tokio::fs::read_dir(&modules_dir)
            .await
            .map_err(|e| storage_error(&modules_dir, e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error(&modules_dir, e))?
        {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ModuleId>().ok())
            else {
                continue;
            };
            let layout = self.layout(id);

            if tokio::fs::try_exists(layout.tombstone_path()).await.unwrap_or(false) {
                debug!(module_id = id, "清理已卸载模块的推迟内容");
                if let Err(e) = tokio::fs::remove_dir_all(&layout.dir).await {
                    warn!(module_id = id, error = %e, "清理已卸载模块失败");
                }
                continue;
            }

            let state = match layout.read_state().await {
                Ok(state) => state,
                Err(e) => {
                    // 安装事务未提交留下的目录
                    warn!(module_id = id, error = %e, "跳过没有有效状态文件的模块目录");
                    continue;
                }
            };

            purge_stale_generations(&layout, state.generation).await;

            let descriptor = layout.read_descriptor(state.generation).await?;
            records.push(PersistentRecord {
                id: state.id,
                location: state.location,
                descriptor,
                generation: state.generation,
                flags: state.flags,
                start_level: state.start_level,
            });
        }

        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn load_next_id(&self) -> Result<ModuleId> {
        let path = self.root.join(NEXT_ID_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content
                .trim()
                .parse()
                .map_err(|e| storage_error(&path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(1),
            Err(e) => Err(storage_error(&path, e)),
        }
    }

    async fn save_next_id(&self, next: ModuleId) -> Result<()> {
        let current = self.load_next_id().await.unwrap_or(1);
        write_atomic(
            &self.root.join(NEXT_ID_FILE),
            next.max(current).to_string().as_bytes(),
        )
        .await
    }
}

/// 删除当前代以外的全部代目录
async fn purge_stale_generations(layout: &ModuleLayout, current: u64) {
    let Ok(mut entries) = tokio::fs::read_dir(&layout.dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(generation) = name
            .to_str()
            .and_then(|n| n.strip_prefix("gen-"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        if generation != current {
            layout.remove_generation(generation).await;
        }
    }
}

// ==================== 事务 ====================

struct InstallOperation {
    layout: ModuleLayout,
    id: ModuleId,
    location: String,
    source: ModuleSource,
    start_level: i32,
    staged: Option<StateFile>,
}

#[async_trait]
impl StorageOperation for InstallOperation {
    async fn begin(&mut self) -> Result<StagedRecord> {
        let descriptor = self.source.load().await?;
        self.layout.write_descriptor(0, &descriptor).await?;
        let state = StateFile {
            id: self.id,
            location: self.location.clone(),
            generation: 0,
            flags: PersistentFlags::empty(),
            start_level: self.start_level,
        };
        self.staged = Some(state);
        Ok(StagedRecord {
            id: self.id,
            location: self.location.clone(),
            revision: crate::module::record::ModuleRevision::new(descriptor, 0),
        })
    }

    async fn commit(&mut self, _in_use: bool) -> Result<()> {
        let state = self
            .staged
            .as_ref()
            .ok_or_else(|| CoreError::StorageFailed("事务尚未开始".to_string()))?;
        self.layout.write_state(state).await
    }

    async fn undo(&mut self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.layout.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&self.layout.dir, e)),
        }
    }
}

struct UpdateOperation {
    layout: ModuleLayout,
    source: ModuleSource,
    previous: Option<StateFile>,
    staged: Option<StateFile>,
    committed: bool,
}

#[async_trait]
impl StorageOperation for UpdateOperation {
    async fn begin(&mut self) -> Result<StagedRecord> {
        let descriptor = self.source.load().await?;
        let previous = self.layout.read_state().await?;
        let generation = previous.generation + 1;
        self.layout.write_descriptor(generation, &descriptor).await?;

        let staged = StateFile {
            generation,
            ..previous.clone()
        };
        let record = StagedRecord {
            id: staged.id,
            location: staged.location.clone(),
            revision: crate::module::record::ModuleRevision::new(descriptor, generation),
        };
        self.previous = Some(previous);
        self.staged = Some(staged);
        Ok(record)
    }

    async fn commit(&mut self, in_use: bool) -> Result<()> {
        let (Some(previous), Some(staged)) = (self.previous.as_ref(), self.staged.as_mut()) else {
            return Err(CoreError::StorageFailed("事务尚未开始".to_string()));
        };
        // 标志位和启动级别以当前文件为准
        if let Ok(current) = self.layout.read_state().await {
            staged.flags = current.flags;
            staged.start_level = current.start_level;
        }
        self.layout.write_state(staged).await?;
        self.committed = true;
        if !in_use {
            self.layout.remove_generation(previous.generation).await;
        }
        Ok(())
    }

    async fn undo(&mut self) -> Result<()> {
        if self.committed {
            if let Some(ref previous) = self.previous {
                let descriptor_path = self
                    .layout
                    .generation_dir(previous.generation)
                    .join(DESCRIPTOR_FILE);
                if !tokio::fs::try_exists(&descriptor_path).await.unwrap_or(false) {
                    return Err(CoreError::StorageFailed(format!(
                        "旧代内容已清理，无法撤销: {}",
                        descriptor_path.display()
                    )));
                }
                self.layout.write_state(previous).await?;
            }
            self.committed = false;
        }
        if let Some(ref staged) = self.staged {
            self.layout.remove_generation(staged.generation).await;
        }
        Ok(())
    }
}

struct UninstallOperation {
    layout: ModuleLayout,
    previous: Option<StateFile>,
    committed: bool,
}

#[async_trait]
impl StorageOperation for UninstallOperation {
    async fn begin(&mut self) -> Result<StagedRecord> {
        let state = self.layout.read_state().await?;
        let descriptor = self.layout.read_descriptor(state.generation).await?;
        let record = StagedRecord {
            id: state.id,
            location: state.location.clone(),
            revision: crate::module::record::ModuleRevision::new(descriptor, state.generation),
        };
        self.previous = Some(state);
        Ok(record)
    }

    async fn commit(&mut self, in_use: bool) -> Result<()> {
        if self.previous.is_none() {
            return Err(CoreError::StorageFailed("事务尚未开始".to_string()));
        }
        if in_use {
            // 内容仍被使用：留下墓碑，下次加载时清理
            write_atomic(&self.layout.tombstone_path(), b"").await?;
            self.committed = true;
        } else {
            tokio::fs::remove_dir_all(&self.layout.dir)
                .await
                .map_err(|e| storage_error(&self.layout.dir, e))?;
            self.committed = true;
        }
        Ok(())
    }

    async fn undo(&mut self) -> Result<()> {
        if !self.committed {
            return Ok(());
        }
        let tombstone = self.layout.tombstone_path();
        if tokio::fs::try_exists(&tombstone).await.unwrap_or(false) {
            tokio::fs::remove_file(&tombstone)
                .await
                .map_err(|e| storage_error(&tombstone, e))?;
            self.committed = false;
            return Ok(());
        }
        Err(CoreError::StorageFailed(format!(
            "模块目录已删除，无法撤销: {}",
            self.layout.dir.display()
        )))
    }
}
