//! 协程事件
//!
//! 可加锁的 "已发生" 标志。等待者在持有事件锁的情况下检查标志并挂起；
//! 事件记录每个有等待者的 worker，唤醒时分发到这些 worker。

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::value::Value;

/// 事件 ID 生成器
static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// 事件状态（受事件锁保护）
#[derive(Debug, Default)]
pub struct EventState {
    /// 是否已发生
    happened: bool,
    /// 有等待者的 worker（每个 worker 至多一个等待者）
    host_workers: Vec<usize>,
}

impl EventState {
    /// 是否已发生
    #[inline]
    pub fn happened(&self) -> bool {
        self.happened
    }

    /// 标记为已发生
    #[inline]
    pub fn set_happened(&mut self) {
        self.happened = true;
    }

    /// 标记为未发生
    #[inline]
    pub fn set_not_happened(&mut self) {
        self.happened = false;
    }

    /// 有等待者的 worker
    #[inline]
    pub fn host_workers(&self) -> &[usize] {
        &self.host_workers
    }

    /// 记录一个有等待者的 worker
    pub fn add_host_worker(&mut self, worker: usize) {
        if !self.host_workers.contains(&worker) {
            self.host_workers.push(worker);
        }
    }

    /// 取出所有有等待者的 worker
    pub fn take_host_workers(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.host_workers)
    }
}

/// 事件锁的持有凭证
pub type EventGuard<'a> = MutexGuard<'a, EventState>;

/// 协程事件
#[derive(Debug)]
pub struct CoroutineEvent {
    /// 事件 ID（等待表的键）
    id: u64,
    /// 事件状态
    state: Mutex<EventState>,
}

impl CoroutineEvent {
    /// 创建未发生的事件
    pub fn new() -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(EventState::default()),
        }
    }

    /// 事件 ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 加锁
    pub fn lock(&self) -> EventGuard<'_> {
        self.state.lock()
    }

    /// `guard` 是否是本事件的锁
    pub fn owns(&self, guard: &EventGuard<'_>) -> bool {
        std::ptr::eq(MutexGuard::mutex(guard), &self.state)
    }

    /// 是否已发生
    pub fn happened(&self) -> bool {
        self.state.lock().happened()
    }

    /// 加锁并标记为已发生
    pub fn set_happened(&self) {
        self.state.lock().set_happened();
    }

    /// 加锁并标记为未发生
    pub fn set_not_happened(&self) {
        self.state.lock().set_not_happened();
    }
}

impl Default for CoroutineEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// 完成事件
///
/// 托管协程结束时由 `Coroutine::request_completion` 写入结果并标记为已发生。
#[derive(Debug, Default)]
pub struct CompletionEvent {
    event: CoroutineEvent,
    result: Mutex<Option<Value>>,
}

impl CompletionEvent {
    /// 创建完成事件
    pub fn new() -> Self {
        Self::default()
    }

    /// 底层事件（用于 await/unblock）
    #[inline]
    pub fn event(&self) -> &CoroutineEvent {
        &self.event
    }

    /// 写入结果并标记为已发生
    pub fn complete(&self, result: Value) {
        let mut state = self.event.lock();
        *self.result.lock() = Some(result);
        state.set_happened();
    }

    /// 是否已完成
    pub fn happened(&self) -> bool {
        self.event.happened()
    }

    /// 结果
    pub fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_unique() {
        let a = CoroutineEvent::new();
        let b = CoroutineEvent::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_event_flag() {
        let event = CoroutineEvent::new();
        assert!(!event.happened());
        event.set_happened();
        assert!(event.happened());
        event.set_not_happened();
        assert!(!event.happened());
    }

    #[test]
    fn test_guard_ownership() {
        let a = CoroutineEvent::new();
        let b = CoroutineEvent::new();
        let guard = a.lock();
        assert!(a.owns(&guard));
        assert!(!b.owns(&guard));
    }

    #[test]
    fn test_host_workers() {
        let event = CoroutineEvent::new();
        {
            let mut state = event.lock();
            assert!(state.host_workers().is_empty());
            state.add_host_worker(3);
            state.add_host_worker(0);
            state.add_host_worker(3);
            assert_eq!(state.host_workers(), &[3, 0]);
        }
        assert_eq!(event.lock().take_host_workers(), vec![3, 0]);
        assert!(event.lock().host_workers().is_empty());
    }

    #[test]
    fn test_completion_event() {
        let completion = CompletionEvent::new();
        assert!(!completion.happened());
        assert_eq!(completion.result(), None);
        completion.complete(Value::from("done"));
        assert!(completion.happened());
        assert_eq!(completion.result(), Some(Value::from("done")));
    }
}
