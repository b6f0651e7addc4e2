//! 持久化存储
//!
//! 定义模块持久化记录和事务接口。安装、更新和卸载都以事务形式进行：
//! `begin` 暂存新记录，`commit` 使其生效，`undo` 撤销到事务开始前的状态。
//!
//! 提供两个实现：
//! - [`MemoryStorage`]：进程内存储，用于测试和不需要持久化的场景
//! - [`FileStorage`](crate::module::file_storage::FileStorage)：数据目录中的 JSON 记录

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::module::metadata::{ModuleDescriptor, PersistentFlags};
use crate::module::parser::ModuleParser;
use crate::module::record::ModuleRevision;
use crate::utils::{CoreError, ModuleId, Result};

/// 模块内容来源
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// 包含 module.yaml / module.json 的目录
    Directory(PathBuf),
    /// 直接给出的描述
    Descriptor(ModuleDescriptor),
}

impl ModuleSource {
    /// 读取并校验描述
    pub async fn load(&self) -> Result<ModuleDescriptor> {
        match self {
            ModuleSource::Directory(dir) => ModuleParser::parse_dir(dir).await,
            ModuleSource::Descriptor(descriptor) => {
                ModuleParser::validate(descriptor)?;
                Ok(descriptor.clone())
            }
        }
    }
}

/// 持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentRecord {
    pub id: ModuleId,
    pub location: String,
    pub descriptor: ModuleDescriptor,
    pub generation: u64,
    #[serde(default)]
    pub flags: PersistentFlags,
    pub start_level: i32,
}

impl PersistentRecord {
    pub fn revision(&self) -> ModuleRevision {
        ModuleRevision::new(self.descriptor.clone(), self.generation)
    }
}

/// 事务暂存的记录
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRecord {
    pub id: ModuleId,
    pub location: String,
    pub revision: ModuleRevision,
}

impl From<&PersistentRecord> for StagedRecord {
    fn from(record: &PersistentRecord) -> Self {
        Self {
            id: record.id,
            location: record.location.clone(),
            revision: record.revision(),
        }
    }
}

/// 存储事务
#[async_trait]
pub trait StorageOperation: Send {
    /// 开始事务，返回暂存的记录（卸载时为当前记录）
    async fn begin(&mut self) -> Result<StagedRecord>;

    /// 提交事务
    ///
    /// `in_use` 为 true 表示旧内容仍被其他模块使用，存储层需要推迟清理旧内容。
    async fn commit(&mut self, in_use: bool) -> Result<()>;

    /// 撤销事务，恢复到 `begin` 之前的状态
    async fn undo(&mut self) -> Result<()>;
}

/// 模块持久化存储
#[async_trait]
pub trait ModuleStorage: Send + Sync {
    /// 创建安装事务
    fn install_module(
        &self,
        id: ModuleId,
        location: &str,
        source: ModuleSource,
        start_level: i32,
    ) -> Box<dyn StorageOperation>;

    /// 创建更新事务
    fn update_module(&self, id: ModuleId, source: ModuleSource) -> Box<dyn StorageOperation>;

    /// 创建卸载事务
    fn uninstall_module(&self, id: ModuleId) -> Box<dyn StorageOperation>;

    /// 保存标志位和启动级别
    async fn save_module_state(
        &self,
        id: ModuleId,
        flags: PersistentFlags,
        start_level: i32,
    ) -> Result<()>;

    /// 读取全部记录（按 ID 升序），并清理上次推迟的旧内容
    async fn load_all(&self) -> Result<Vec<PersistentRecord>>;

    /// 下一个可分配的模块 ID
    async fn load_next_id(&self) -> Result<ModuleId>;

    /// 保存下一个可分配的模块 ID
    async fn save_next_id(&self, next: ModuleId) -> Result<()>;
}

// ==================== 内存存储 ====================

type Records = Arc<Mutex<BTreeMap<ModuleId, PersistentRecord>>>;

fn lock(records: &Records) -> std::sync::MutexGuard<'_, BTreeMap<ModuleId, PersistentRecord>> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 内存存储
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    records: Records,
    next_id: Arc<AtomicU64>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            records: Arc::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查看记录（测试和诊断用）
    pub fn record(&self, id: ModuleId) -> Option<PersistentRecord> {
        lock(&self.records).get(&id).cloned()
    }
}

#[async_trait]
impl ModuleStorage for MemoryStorage {
    fn install_module(
        &self,
        id: ModuleId,
        location: &str,
        source: ModuleSource,
        start_level: i32,
    ) -> Box<dyn StorageOperation> {
        Box::new(MemoryOperation {
            records: self.records.clone(),
            id,
            kind: MemoryOperationKind::Install {
                location: location.to_string(),
                source,
                start_level,
            },
            staged: None,
            previous: None,
            committed: false,
        })
    }

    fn update_module(&self, id: ModuleId, source: ModuleSource) -> Box<dyn StorageOperation> {
        Box::new(MemoryOperation {
            records: self.records.clone(),
            id,
            kind: MemoryOperationKind::Update { source },
            staged: None,
            previous: None,
            committed: false,
        })
    }

    fn uninstall_module(&self, id: ModuleId) -> Box<dyn StorageOperation> {
        Box::new(MemoryOperation {
            records: self.records.clone(),
            id,
            kind: MemoryOperationKind::Uninstall,
            staged: None,
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
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&id)
            .ok_or_else(|| CoreError::StorageFailed(format!("模块 {} 没有持久化记录", id)))?;
        record.flags = flags;
        record.start_level = start_level;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PersistentRecord>> {
        Ok(lock(&self.records).values().cloned().collect())
    }

    async fn load_next_id(&self) -> Result<ModuleId> {
        Ok(self.next_id.load(Ordering::SeqCst))
    }

    async fn save_next_id(&self, next: ModuleId) -> Result<()> {
        self.next_id.fetch_max(next, Ordering::SeqCst);
        Ok(())
    }
}

enum MemoryOperationKind {
    Install {
        location: String,
        source: ModuleSource,
        start_level: i32,
    },
    Update {
        source: ModuleSource,
    },
    Uninstall,
}

struct MemoryOperation {
    records: Records,
    id: ModuleId,
    kind: MemoryOperationKind,
    staged: Option<PersistentRecord>,
    previous: Option<PersistentRecord>,
    committed: bool,
}

impl MemoryOperation {
    fn current(&self) -> Result<PersistentRecord> {
        lock(&self.records)
            .get(&self.id)
            .cloned()
            .ok_or_else(|| CoreError::StorageFailed(format!("模块 {} 没有持久化记录", self.id)))
    }
}

#[async_trait]
impl StorageOperation for MemoryOperation {
    async fn begin(&mut self) -> Result<StagedRecord> {
        let staged = match &self.kind {
            MemoryOperationKind::Install {
                location,
                source,
                start_level,
            } => PersistentRecord {
                id: self.id,
                location: location.clone(),
                descriptor: source.load().await?,
                generation: 0,
                flags: PersistentFlags::empty(),
                start_level: *start_level,
            },
            MemoryOperationKind::Update { source } => {
                let descriptor = source.load().await?;
                let current = self.current()?;
                let staged = PersistentRecord {
                    descriptor,
                    generation: current.generation + 1,
                    ..current.clone()
                };
                self.previous = Some(current);
                staged
            }
            MemoryOperationKind::Uninstall => {
                let current = self.current()?;
                self.previous = Some(current.clone());
                current
            }
        };
        let result = StagedRecord::from(&staged);
        self.staged = Some(staged);
        Ok(result)
    }

    async fn commit(&mut self, _in_use: bool) -> Result<()> {
        let staged = self
            .staged
            .clone()
            .ok_or_else(|| CoreError::StorageFailed("事务尚未开始".to_string()))?;
        let mut records = lock(&self.records);
        match self.kind {
            MemoryOperationKind::Uninstall => {
                records.remove(&self.id);
            }
            _ => {
                // 标志位和启动级别以当前记录为准，事务期间可能被单独保存过
                let mut staged = staged;
                if let Some(current) = records.get(&self.id) {
                    staged.flags = current.flags;
                    staged.start_level = current.start_level;
                }
                records.insert(self.id, staged);
            }
        }
        self.committed = true;
        Ok(())
    }

    async fn undo(&mut self) -> Result<()> {
        if !self.committed {
            return Ok(());
        }
        let mut records = lock(&self.records);
        match self.previous.take() {
            Some(previous) => {
                records.insert(self.id, previous);
            }
            None => {
                records.remove(&self.id);
            }
        }
        self.committed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(version: &str) -> ModuleSource {
        ModuleSource::Descriptor(ModuleDescriptor::new("chips.editor", version))
    }

    #[tokio::test]
    async fn test_install_commit() {
        let storage = MemoryStorage::new();
        let mut op = storage.install_module(1, "mem:editor", source("1.0.0"), 3);
        let staged = op.begin().await.unwrap();
        assert_eq!(staged.id, 1);
        assert_eq!(staged.revision.generation, 0);
        assert!(storage.record(1).is_none());

        op.commit(false).await.unwrap();
        let record = storage.record(1).unwrap();
        assert_eq!(record.start_level, 3);
        assert_eq!(record.location, "mem:editor");
    }

    #[tokio::test]
    async fn test_update_undo_restores_previous() {
        let storage = MemoryStorage::new();
        let mut op = storage.install_module(1, "mem:editor", source("1.0.0"), 1);
        op.begin().await.unwrap();
        op.commit(false).await.unwrap();
        storage
            .save_module_state(1, PersistentFlags::AUTO_START, 1)
            .await
            .unwrap();

        let mut update = storage.update_module(1, source("2.0.0"));
        let staged = update.begin().await.unwrap();
        assert_eq!(staged.revision.generation, 1);
        update.commit(true).await.unwrap();

        let record = storage.record(1).unwrap();
        assert_eq!(record.descriptor.version, "2.0.0");
        assert!(record.flags.contains(PersistentFlags::AUTO_START));

        update.undo().await.unwrap();
        assert_eq!(storage.record(1).unwrap().descriptor.version, "1.0.0");
    }

    #[tokio::test]
    async fn test_uninstall_and_undo() {
        let storage = MemoryStorage::new();
        let mut op = storage.install_module(1, "mem:editor", source("1.0.0"), 1);
        op.begin().await.unwrap();
        op.commit(false).await.unwrap();

        let mut uninstall = storage.uninstall_module(1);
        uninstall.begin().await.unwrap();
        uninstall.commit(false).await.unwrap();
        assert!(storage.load_all().await.unwrap().is_empty());

        uninstall.undo().await.unwrap();
        assert_eq!(storage.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let storage = MemoryStorage::new();
        let mut update = storage.update_module(9, source("1.0.0"));
        assert!(matches!(update.begin().await, Err(CoreError::StorageFailed(_))));
    }

    #[tokio::test]
    async fn test_invalid_source_rejected() {
        let storage = MemoryStorage::new();
        let mut op = storage.install_module(1, "mem:bad", source("not-a-version"), 1);
        assert!(matches!(op.begin().await, Err(CoreError::InvalidMetadata(_))));
    }

    #[tokio::test]
    async fn test_next_id_never_decreases() {
        let storage = MemoryStorage::new();
        storage.save_next_id(10).await.unwrap();
        storage.save_next_id(4).await.unwrap();
        assert_eq!(storage.load_next_id().await.unwrap(), 10);
    }
}
