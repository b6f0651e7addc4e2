//! 生命周期事件
//!
//! 容器通过 [`EventSink`] 发布生命周期事件和错误事件。发布是"发出即忘"的：
//! 不阻塞调用方，也不把任何失败传回调用方。
//!
//! 默认实现 [`EventDispatcher`] 基于 tokio broadcast 通道扇出，订阅者可以用
//! `module.*` 这样的模式过滤事件类型。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::module::record::Module;
use crate::utils::{generate_uuid, CoreError, ModuleId};

/// 默认通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// 生命周期事件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Installed,
    Resolved,
    Started,
    Stopped,
    Updated,
    Uninstalled,
    Unresolved,
}

impl LifecycleEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEventKind::Installed => "installed",
            LifecycleEventKind::Resolved => "resolved",
            LifecycleEventKind::Started => "started",
            LifecycleEventKind::Stopped => "stopped",
            LifecycleEventKind::Updated => "updated",
            LifecycleEventKind::Uninstalled => "uninstalled",
            LifecycleEventKind::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事件内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// 生命周期事件
    Lifecycle { kind: LifecycleEventKind },
    /// 错误事件
    Error { error_code: String, message: String },
}

/// 容器事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// 事件唯一标识
    pub event_id: String,

    /// 模块 ID
    pub module_id: ModuleId,

    /// 模块位置
    pub location: String,

    /// 模块符号名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbolic_name: Option<String>,

    /// 事件内容
    pub payload: EventPayload,

    /// 事件时间戳
    pub timestamp: DateTime<Utc>,
}

impl ContainerEvent {
    /// 创建生命周期事件
    pub fn lifecycle(kind: LifecycleEventKind, module: &Module) -> Self {
        Self::new(module, EventPayload::Lifecycle { kind })
    }

    /// 创建错误事件
    pub fn error(module: &Module, error: &CoreError) -> Self {
        Self::new(
            module,
            EventPayload::Error {
                error_code: error.error_code().to_string(),
                message: error.to_string(),
            },
        )
    }

    fn new(module: &Module, payload: EventPayload) -> Self {
        Self {
            event_id: generate_uuid(),
            module_id: module.id(),
            location: module.location().to_string(),
            symbolic_name: module.symbolic_name(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// 事件类型（`module.started`、`module.error` ...）
    pub fn event_type(&self) -> String {
        match self.payload {
            EventPayload::Lifecycle { kind } => format!("module.{}", kind),
            EventPayload::Error { .. } => "module.error".to_string(),
        }
    }

    /// 生命周期事件的种类，错误事件为 `None`
    pub fn lifecycle_kind(&self) -> Option<LifecycleEventKind> {
        match self.payload {
            EventPayload::Lifecycle { kind } => Some(kind),
            EventPayload::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, EventPayload::Error { .. })
    }
}

/// 事件出口
pub trait EventSink: Send + Sync {
    /// 发布生命周期事件
    fn publish_lifecycle_event(&self, kind: LifecycleEventKind, module: &Module);

    /// 发布错误事件
    fn publish_error_event(&self, module: &Module, error: &CoreError);
}

/// 匹配事件类型模式（支持 `*` 和 `prefix.*`）
fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(".*") {
        return value.starts_with(prefix) && value.len() > prefix.len();
    }

    pattern == value
}

/// 事件分发器
#[derive(Debug)]
pub struct EventDispatcher {
    sender: broadcast::Sender<ContainerEvent>,
    published: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// 指定通道容量；订阅者落后超过容量时会丢失最早的事件
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_pattern("*")
    }

    /// 按事件类型模式订阅，例如 `module.*`、`module.error`
    pub fn subscribe_pattern(&self, pattern: impl Into<String>) -> EventSubscription {
        EventSubscription {
            pattern: pattern.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// 已发布的事件数
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn dispatch(&self, event: ContainerEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(
            event_id = %event.event_id,
            event_type = %event.event_type(),
            module_id = event.module_id,
            "发布容器事件"
        );
        // 没有订阅者时发送失败，直接丢弃
        let _ = self.sender.send(event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventDispatcher {
    fn publish_lifecycle_event(&self, kind: LifecycleEventKind, module: &Module) {
        debug!(module_id = module.id(), event_kind = %kind, "生命周期事件");
        self.dispatch(ContainerEvent::lifecycle(kind, module));
    }

    fn publish_error_event(&self, module: &Module, error: &CoreError) {
        warn!(
            module_id = module.id(),
            error_code = error.error_code(),
            error = %error,
            "模块错误事件"
        );
        self.dispatch(ContainerEvent::error(module, error));
    }
}

/// 事件订阅
#[derive(Debug)]
pub struct EventSubscription {
    pattern: String,
    receiver: broadcast::Receiver<ContainerEvent>,
}

impl EventSubscription {
    /// 等待下一个匹配的事件，分发器关闭时返回 `None`
    pub async fn recv(&mut self) -> Option<ContainerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if matches_pattern(&self.pattern, &event.event_type()) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "事件订阅落后，丢失部分事件");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 取出已到达的全部匹配事件，不等待
    pub fn drain(&mut self) -> Vec<ContainerEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if matches_pattern(&self.pattern, &event.event_type()) {
                        events.push(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "事件订阅落后，丢失部分事件");
                }
                Err(_) => return events,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::{ModuleDescriptor, PersistentFlags};
    use crate::module::record::ModuleRevision;

    fn module() -> Module {
        Module::new(
            5,
            "mem:editor",
            ModuleRevision::new(ModuleDescriptor::new("chips.editor", "1.0.0"), 0),
            PersistentFlags::empty(),
            1,
        )
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("*", "module.started"));
        assert!(matches_pattern("module.*", "module.started"));
        assert!(!matches_pattern("module.*", "module"));
        assert!(matches_pattern("module.error", "module.error"));
        assert!(!matches_pattern("module.error", "module.stopped"));
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let dispatcher = EventDispatcher::new();
        let mut all = dispatcher.subscribe();
        let m = module();

        dispatcher.publish_lifecycle_event(LifecycleEventKind::Started, &m);
        let event = all.recv().await.unwrap();
        assert_eq!(event.module_id, 5);
        assert_eq!(event.lifecycle_kind(), Some(LifecycleEventKind::Started));
        assert_eq!(event.event_type(), "module.started");
        assert_eq!(event.symbolic_name.as_deref(), Some("chips.editor"));
    }

    #[tokio::test]
    async fn test_pattern_subscription_filters() {
        let dispatcher = EventDispatcher::new();
        let mut errors = dispatcher.subscribe_pattern("module.error");
        let m = module();

        dispatcher.publish_lifecycle_event(LifecycleEventKind::Stopped, &m);
        dispatcher.publish_error_event(&m, &CoreError::StorageFailed("disk full".into()));

        let events = errors.drain();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
        match &events[0].payload {
            EventPayload::Error { error_code, message } => {
                assert_eq!(error_code, "STORAGE-001");
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let dispatcher = EventDispatcher::new();
        dispatcher.publish_lifecycle_event(LifecycleEventKind::Installed, &module());
        assert_eq!(dispatcher.published_count(), 1);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = ContainerEvent::lifecycle(LifecycleEventKind::Updated, &module());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "lifecycle");
        assert_eq!(json["payload"]["kind"], "updated");
    }
}
