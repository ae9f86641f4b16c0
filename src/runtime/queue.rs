//! 可运行队列
//!
//! worker 的可运行协程队列（受 worker 的队列锁保护）和它的负载因子

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::coroutine::Coroutine;

/// 可运行队列
///
/// 默认 FIFO；优先的协程插到队首。
#[derive(Debug, Default)]
pub struct RunnableQueue {
    queue: VecDeque<Arc<Coroutine>>,
}

impl RunnableQueue {
    /// 创建空队列
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// 队列长度
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 推入协程
    pub fn push(&mut self, co: Arc<Coroutine>, prioritize: bool) {
        if prioritize {
            self.queue.push_front(co);
        } else {
            self.queue.push_back(co);
        }
    }

    /// 从队首弹出
    pub fn pop(&mut self) -> Option<Arc<Coroutine>> {
        self.queue.pop_front()
    }

    /// 队列中是否有指定协程
    pub fn contains(&self, co: &Coroutine) -> bool {
        self.queue.iter().any(|c| std::ptr::eq(Arc::as_ptr(c), co))
    }

    /// 按队列顺序列出协程名
    pub fn names(&self) -> Vec<String> {
        self.queue.iter().map(|c| c.name()).collect()
    }

    /// 遍历队列
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Coroutine>> {
        self.queue.iter()
    }
}

/// 负载因子
///
/// 队列长度的滑动平均：`lf = (lf + len) / 2`。写入在队列锁内，读取无锁（投放协程时比较各 worker）。
#[derive(Debug)]
pub struct LoadFactor {
    bits: CachePadded<AtomicU64>,
}

impl LoadFactor {
    /// 创建负载因子（初始为 0）
    pub fn new() -> Self {
        Self {
            bits: CachePadded::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    /// 当前值
    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// 以当前队列长度更新
    pub fn update(&self, queue_len: usize) {
        let value = (self.get() + queue_len as f64) / 2.0;
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for LoadFactor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::CoroutineContext;
    use crate::runtime::coroutine::{CoroutineId, CoroutineType};

    fn make_test_coroutine(id: u64) -> Arc<Coroutine> {
        Coroutine::new(
            CoroutineId(id),
            format!("co_{}", id),
            CoroutineType::Regular,
            CoroutineContext::new(None),
            None,
            None,
        )
    }

    #[test]
    fn test_runnable_queue_fifo() {
        let mut queue = RunnableQueue::new();
        queue.push(make_test_coroutine(1), false);
        queue.push(make_test_coroutine(2), false);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap().id(), CoroutineId(1));
        assert_eq!(queue.pop().unwrap().id(), CoroutineId(2));
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_runnable_queue_prioritized() {
        let mut queue = RunnableQueue::new();
        queue.push(make_test_coroutine(1), false);
        queue.push(make_test_coroutine(2), true);
        assert_eq!(queue.names(), vec!["co_2".to_string(), "co_1".to_string()]);
        assert_eq!(queue.pop().unwrap().id(), CoroutineId(2));
    }

    #[test]
    fn test_runnable_queue_contains() {
        let mut queue = RunnableQueue::new();
        let a = make_test_coroutine(1);
        let b = make_test_coroutine(2);
        queue.push(Arc::clone(&a), false);
        assert!(queue.contains(&a));
        assert!(!queue.contains(&b));
    }

    #[test]
    fn test_load_factor_moving_average() {
        let lf = LoadFactor::new();
        assert_eq!(lf.get(), 0.0);
        lf.update(4);
        assert_eq!(lf.get(), 2.0);
        lf.update(4);
        assert_eq!(lf.get(), 3.0);
        lf.update(0);
        assert_eq!(lf.get(), 1.5);
    }
}
