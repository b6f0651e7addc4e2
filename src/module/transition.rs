//! 状态变更锁
//!
//! 每个模块持有一把状态变更锁，同一时刻最多只有一个任务在对该模块执行状态转换。
//!
//! - 锁空闲时立即由调用任务占有
//! - 锁已被调用任务自己占有时立即失败（不允许重入）
//! - 锁被其他任务占有时最多等待一个超时周期，期间被唤醒则重试占有，
//!   超过期限仍未能占有则以超时失败
//!
//! 任务身份通过 [`with_owner`] 建立的 task-local 作用域传递。同一作用域内的嵌套调用
//! 共享身份，因此激活器在自己的启动回调里再次操作本模块会被识别为重入。
//! [`with_new_owner`] 开出的子身份记得外层身份，锁被外层身份持有时同样视为重入。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::utils::{CoreError, ModuleId, Result};

/// 默认等待上限
pub const DEFAULT_STATE_CHANGE_TIMEOUT: Duration = Duration::from_millis(5000);

tokio::task_local! {
    static TRANSITION_OWNER: OwnerScope;
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// 执行状态转换的任务身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    fn fresh() -> Self {
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// 当前任务的身份，不在 [`with_owner`] 作用域内时为 `None`
    pub fn current() -> Option<Self> {
        TRANSITION_OWNER.try_with(|scope| scope.owner).ok()
    }
}

/// 身份作用域：当前身份和开出它的外层身份
#[derive(Debug, Clone)]
struct OwnerScope {
    owner: OwnerId,
    outer: Arc<[OwnerId]>,
}

impl OwnerScope {
    fn root() -> Self {
        Self {
            owner: OwnerId::fresh(),
            outer: Arc::from(Vec::new()),
        }
    }

    fn child(&self) -> Self {
        let mut outer = self.outer.to_vec();
        outer.push(self.owner);
        Self {
            owner: OwnerId::fresh(),
            outer: Arc::from(outer),
        }
    }

    fn current() -> Option<Self> {
        TRANSITION_OWNER.try_with(Clone::clone).ok()
    }

    /// `owner` 是当前身份或它的外层身份
    fn includes(&self, owner: OwnerId) -> bool {
        self.owner == owner || self.outer.contains(&owner)
    }
}

/// 在任务身份作用域内执行 `fut`
///
/// 已经处于作用域内时沿用外层身份，否则分配新身份。
/// 容器的所有公开生命周期操作都经由它进入。
pub async fn with_owner<F>(fut: F) -> F::Output
where
    F: Future,
{
    if OwnerId::current().is_some() {
        fut.await
    } else {
        TRANSITION_OWNER.scope(OwnerScope::root(), fut).await
    }
}

/// 总是以新身份执行 `fut`，用于同一任务内并发推进多个模块
///
/// 新身份记得外层身份：外层已持有的锁对它来说仍是重入，立即失败而不是等待超时。
pub async fn with_new_owner<F>(fut: F) -> F::Output
where
    F: Future,
{
    let scope = match OwnerScope::current() {
        Some(outer) => outer.child(),
        None => OwnerScope::root(),
    };
    TRANSITION_OWNER.scope(scope, fut).await
}

/// 状态变更锁
#[derive(Debug, Default)]
pub struct TransitionLock {
    owner: Mutex<Option<OwnerId>>,
    released: Notify,
}

impl TransitionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 占有锁（beginStateChange）
    ///
    /// # Arguments
    ///
    /// * `module_id` - 锁所属模块，用于错误信息
    /// * `timeout` - 等待上限
    ///
    /// # Errors
    ///
    /// - 调用任务已持有该锁时返回 `ReentrantStateChange`
    /// - 超过等待上限仍被其他任务持有时返回 `StateChangeTimeout`
    pub async fn acquire(
        &self,
        module_id: ModuleId,
        timeout: Duration,
    ) -> Result<TransitionGuard<'_>> {
        let scope = OwnerScope::current().unwrap_or_else(OwnerScope::root);
        let me = scope.owner;
        let started = Instant::now();
        let mut deadline: Option<Instant> = None;

        loop {
            // 先登记等待，再检查占有者，避免错过检查与等待之间的释放通知
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
                match *owner {
                    None => {
                        *owner = Some(me);
                        return Ok(TransitionGuard {
                            lock: self,
                            owner: me,
                            waited: started.elapsed(),
                        });
                    }
                    Some(current) if scope.includes(current) => {
                        return Err(CoreError::ReentrantStateChange { module_id });
                    }
                    Some(_) => {
                        if let Some(deadline) = deadline {
                            if Instant::now() >= deadline {
                                return Err(CoreError::StateChangeTimeout {
                                    module_id,
                                    waited_ms: started.elapsed().as_millis() as u64,
                                });
                            }
                        }
                    }
                }
            }

            let deadline = *deadline.get_or_insert_with(|| started + timeout);
            trace!(module_id, "等待状态变更锁");
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// 尝试立即占有锁，被占有时返回 `None`（包括被当前任务自己占有）
    pub fn try_acquire(&self) -> Option<TransitionGuard<'_>> {
        let me = OwnerId::current().unwrap_or_else(OwnerId::fresh);
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if owner.is_some() {
            return None;
        }
        *owner = Some(me);
        Some(TransitionGuard {
            lock: self,
            owner: me,
            waited: Duration::ZERO,
        })
    }

    /// 锁当前是否被占有
    pub fn is_held(&self) -> bool {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 锁是否由当前任务持有
    pub fn is_held_by_current(&self) -> bool {
        let me = OwnerId::current();
        me.is_some() && *self.owner.lock().unwrap_or_else(PoisonError::into_inner) == me
    }

    /// 释放锁（completeStateChange），只唤醒一个等待者
    fn release(&self, owner: OwnerId) {
        let mut current = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == Some(owner) {
            *current = None;
            drop(current);
            self.released.notify_one();
        }
    }
}

/// 状态变更锁守卫，离开作用域时释放锁
#[derive(Debug)]
pub struct TransitionGuard<'a> {
    lock: &'a TransitionLock,
    owner: OwnerId,
    waited: Duration,
}

impl TransitionGuard<'_> {
    /// 占有前等待的时长
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(5000);

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_release() {
        let lock = TransitionLock::new();
        {
            let guard = lock.acquire(1, TIMEOUT).await.unwrap();
            assert!(lock.is_held());
            assert_eq!(guard.waited(), Duration::ZERO);
        }
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_reentrant_acquire_fails() {
        let lock = TransitionLock::new();
        with_owner(async {
            let _guard = lock.acquire(7, TIMEOUT).await.unwrap();
            assert!(lock.is_held_by_current());
            let err = lock.acquire(7, TIMEOUT).await.unwrap_err();
            assert!(matches!(err, CoreError::ReentrantStateChange { module_id: 7 }));
        })
        .await;
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_nested_scope_shares_owner() {
        with_owner(async {
            let outer = OwnerId::current();
            with_owner(async move {
                assert_eq!(OwnerId::current(), outer);
            })
            .await;
        })
        .await;
        assert!(OwnerId::current().is_none());
    }

    #[tokio::test]
    async fn test_new_owner_scope_is_distinct() {
        let lock = TransitionLock::new();
        with_owner(async {
            let _guard = lock.acquire(9, TIMEOUT).await.unwrap();
            let outer = OwnerId::current();
            with_new_owner(async {
                assert_ne!(OwnerId::current(), outer);
                assert!(!lock.is_held_by_current());
            })
            .await;
        })
        .await;
    }

    #[tokio::test]
    async fn test_child_owner_sees_outer_lock_as_reentrant() {
        let lock = TransitionLock::new();
        with_owner(async {
            let _guard = lock.acquire(10, TIMEOUT).await.unwrap();
            let (a, b) = tokio::join!(
                with_new_owner(lock.acquire(10, TIMEOUT)),
                with_new_owner(with_new_owner(lock.acquire(10, TIMEOUT))),
            );
            assert!(matches!(a, Err(CoreError::ReentrantStateChange { module_id: 10 })));
            assert!(matches!(b, Err(CoreError::ReentrantStateChange { module_id: 10 })));
        })
        .await;
    }

    #[tokio::test]
    async fn test_sibling_owners_do_not_collide() {
        let lock = TransitionLock::new();
        with_owner(async {
            let first = with_new_owner(lock.acquire(11, TIMEOUT)).await.unwrap();
            let second = with_new_owner(lock.acquire(11, Duration::from_millis(10))).await;
            assert!(matches!(second, Err(CoreError::StateChangeTimeout { module_id: 11, .. })));
            drop(first);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_single_wait() {
        let lock = Arc::new(TransitionLock::new());
        let _held = lock.acquire(3, TIMEOUT).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                with_owner(async {
                    let started = Instant::now();
                    let result = lock.acquire(3, TIMEOUT).await.map(|_| ());
                    (result, started.elapsed())
                })
                .await
            })
        };

        let (result, elapsed) = waiter.await.unwrap();
        assert!(matches!(result, Err(CoreError::StateChangeTimeout { module_id: 3, .. })));
        assert!(elapsed >= TIMEOUT);
        assert!(elapsed < TIMEOUT * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_claims_after_release() {
        let lock = Arc::new(TransitionLock::new());
        let guard = lock.acquire(4, TIMEOUT).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                with_owner(async {
                    lock.acquire(4, TIMEOUT).await.map(|g| g.waited())
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(1000)).await;
        drop(guard);

        let waited = waiter.await.unwrap().unwrap();
        assert!(waited >= Duration::from_millis(1000));
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let lock = TransitionLock::new();
        let guard = lock.try_acquire();
        assert!(guard.is_some());
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }
}
