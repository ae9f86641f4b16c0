//! 有栈协程 worker
//!
//! 一个 worker 是一条调度通道：可运行队列、等待表、终结队列和一个调度循环。
//! worker 0 的调度循环是主线程上的一个 native 协程（fiber），其余 worker 各自占用一个 OS 线程。
//!
//! 锁顺序：事件锁 → 等待表锁 → 队列锁。持有的锁以 guard 的形式沿调度调用链向下传递，
//! 在真正切换上下文之前统一释放。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, Level};

use super::binding;
use super::context::CoroutineContext;
use super::coroutine::{Coroutine, CoroutineStatus, NativeParam};
use super::event::{CoroutineEvent, EventGuard};
use super::manager::StackfulCoroutineManager;
use super::queue::{LoadFactor, RunnableQueue};

/// 调度循环的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleLoopType {
    /// 独占一个 OS 线程，循环运行在线程原生栈上
    Thread,
    /// 作为一个 native 协程运行在宿主线程上
    Fiber,
}

/// 等待表：事件 ID → 阻塞在该事件上的协程
type Waiters = HashMap<u64, Arc<Coroutine>>;

/// 有栈协程 worker
pub struct StackfulCoroutineWorker {
    /// worker 下标
    id: usize,
    /// worker 名字
    name: String,
    /// 调度循环类型
    loop_type: ScheduleLoopType,
    /// 可运行队列
    runnables: Mutex<RunnableQueue>,
    /// 队列非空或 worker 被停用时通知
    runnables_cv: Condvar,
    /// 等待表
    waiters: Mutex<Waiters>,
    /// 终结队列（只由本 worker 的线程访问）
    finalization_queue: Mutex<VecDeque<Arc<Coroutine>>>,
    /// 负载因子
    load_factor: LoadFactor,
    /// 禁止切换的嵌套计数
    disable_switch_counter: AtomicU32,
    /// 是否活跃
    active: AtomicBool,
    /// 调度循环协程
    schedule_loop: Mutex<Option<Arc<Coroutine>>>,
    /// 线程型调度循环的线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 上下文切换次数
    switch_count: AtomicU64,
}

impl StackfulCoroutineWorker {
    /// 创建 worker
    ///
    /// 调度循环协程和线程由 manager 随后装配。
    pub fn new(id: usize, name: impl Into<String>, loop_type: ScheduleLoopType) -> Self {
        Self {
            id,
            name: name.into(),
            loop_type,
            runnables: Mutex::new(RunnableQueue::new()),
            runnables_cv: Condvar::new(),
            waiters: Mutex::new(HashMap::new()),
            finalization_queue: Mutex::new(VecDeque::new()),
            load_factor: LoadFactor::new(),
            disable_switch_counter: AtomicU32::new(0),
            active: AtomicBool::new(true),
            schedule_loop: Mutex::new(None),
            thread: Mutex::new(None),
            switch_count: AtomicU64::new(0),
        }
    }

    /// worker 下标
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// worker 名字
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 调度循环类型
    #[inline]
    pub fn loop_type(&self) -> ScheduleLoopType {
        self.loop_type
    }

    /// 是否活跃
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 设置活跃状态
    ///
    /// 停用时唤醒可能在等待可运行协程的调度循环。
    pub fn set_active(&self, active: bool) {
        let _runnables = self.runnables.lock();
        self.active.store(active, Ordering::Release);
        self.runnables_cv.notify_all();
    }

    /// 负载因子
    #[inline]
    pub fn load_factor(&self) -> f64 {
        self.load_factor.get()
    }

    /// 上下文切换次数
    #[inline]
    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Relaxed)
    }

    /// 调度循环协程
    pub fn schedule_loop(&self) -> Option<Arc<Coroutine>> {
        self.schedule_loop.lock().clone()
    }

    pub(crate) fn set_schedule_loop(&self, co: Arc<Coroutine>) {
        *self.schedule_loop.lock() = Some(co);
    }

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    /// 等待线程型调度循环退出
    pub(crate) fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    // ========================================================================
    // 队列操作
    // ========================================================================

    /// 加入一个可运行协程
    pub fn add_runnable_coroutine(&self, co: Arc<Coroutine>, prioritize: bool) {
        self.push_to_runnable_queue(co, prioritize);
    }

    fn push_to_runnable_queue(&self, co: Arc<Coroutine>, prioritize: bool) {
        let mut runnables = self.runnables.lock();
        self.push_locked(&mut runnables, co, prioritize);
        self.runnables_cv.notify_one();
    }

    fn push_locked(&self, runnables: &mut RunnableQueue, co: Arc<Coroutine>, prioritize: bool) {
        co.context().set_worker(self.id);
        runnables.push(co, prioritize);
        self.load_factor.update(runnables.len());
    }

    fn pop_locked(&self, runnables: &mut RunnableQueue) -> Option<Arc<Coroutine>> {
        let co = runnables.pop();
        self.load_factor.update(runnables.len());
        co
    }

    /// 可运行队列长度
    pub fn runnables_len(&self) -> usize {
        self.runnables.lock().len()
    }

    /// 可运行队列中的协程名（按调度顺序）
    pub fn runnable_names(&self) -> Vec<String> {
        self.runnables.lock().names()
    }

    /// 等待表快照：(事件 ID, 协程名)
    pub fn waiter_names(&self) -> Vec<(u64, String)> {
        let waiters = self.waiters.lock();
        let mut list: Vec<_> = waiters.iter().map(|(id, co)| (*id, co.name())).collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }

    /// 终结队列长度
    pub fn finalization_len(&self) -> usize {
        self.finalization_queue.lock().len()
    }

    /// 以 debug 级别打印可运行队列
    pub fn print_runnables(&self, requester: &str) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        let names = self.runnable_names();
        let chain: String = names.iter().map(|n| format!("{} < ", n)).collect();
        debug!(worker = %self.name, "[{}] {}X", requester, chain);
    }

    // ========================================================================
    // 调度
    // ========================================================================

    /// 请求调度：把当前协程放回队尾，切换到队首的协程
    ///
    /// 队列为空时阻塞等待，直到有新的可运行协程或 worker 被停用。
    pub fn request_schedule(&self, manager: &StackfulCoroutineManager) {
        self.ensure_coroutine_switch_enabled();
        self.ensure_current_on_this_worker();

        let runnables = self.runnables.lock();
        if runnables.is_empty() {
            debug!(worker = %self.name, "no runnables, starting to wait");
            self.wait_for_runnables(runnables);
            return;
        }
        self.suspend_current_and_schedule_next(manager, runnables);
    }

    fn wait_for_runnables(&self, mut runnables: MutexGuard<'_, RunnableQueue>) {
        while runnables.is_empty() && self.is_active() {
            self.runnables_cv.wait(&mut runnables);
            if runnables.is_empty() && self.is_active() {
                trace!(worker = %self.name, "spurious wakeup");
            } else {
                trace!(worker = %self.name, "wakeup");
            }
        }
    }

    /// 等待事件
    ///
    /// 调用方持有事件锁，`guard` 随调用移交。事件已发生时直接返回 false，不切换上下文；
    /// 否则当前协程进入等待表并阻塞，被唤醒后返回 true。
    pub fn wait_for_event(
        &self,
        manager: &StackfulCoroutineManager,
        event: &CoroutineEvent,
        mut guard: EventGuard<'_>,
    ) -> bool {
        if guard.happened() {
            return false;
        }
        self.ensure_coroutine_switch_enabled();
        self.ensure_current_on_this_worker();

        let mut waiters = self.waiters.lock();
        guard.add_host_worker(self.id);
        drop(guard);

        let waiter = self.current_coroutine();
        debug!(worker = %self.name, coroutine = %waiter.name(), event = event.id(), "awaits");
        if waiters.contains_key(&event.id()) {
            crate::fatal!("{}: event {} already has a waiter", self.name, event.id());
        }
        waiters.insert(event.id(), Arc::clone(&waiter));

        let runnables = self.runnables.lock();
        if runnables.is_empty() {
            crate::fatal!("{}: {} blocks with no runnable coroutines left", self.name, waiter.name());
        }
        waiter.context().request_suspend(true);
        drop(waiter);

        self.switch_to_next(runnables, Some(waiters));
        self.finalize_terminated_coroutines(manager);
        true
    }

    /// 唤醒本 worker 上等待该事件的协程
    pub fn unblock_waiters(&self, event: &CoroutineEvent) {
        let mut waiters = self.waiters.lock();
        if let Some(co) = waiters.remove(&event.id()) {
            debug!(worker = %self.name, coroutine = %co.name(), event = event.id(), "unblocked");
            co.context().request_unblock();
            self.push_to_runnable_queue(co, false);
        }
    }

    /// 请求终结当前协程
    ///
    /// 协程进入终结队列，切换到下一个协程后由本 worker 回收。永不返回。
    pub fn request_finalization(&self, co: Arc<Coroutine>) -> ! {
        self.ensure_coroutine_switch_enabled();
        self.ensure_current_on_this_worker();
        if co.worker() != Some(self.id) {
            crate::fatal!("{}: finalizing {} owned by worker {:?}", self.name, co.name(), co.worker());
        }

        self.finalization_queue.lock().push_back(co);
        let runnables = self.runnables.lock();
        self.switch_to_next(runnables, None);
        crate::fatal!("{}: finalized coroutine has been resumed", self.name)
    }

    /// 让 fiber 调度循环最后运行一次，使其退出
    ///
    /// 主协程关闭流程的一部分：此时队列里只剩调度循环。
    pub fn finalize_fiber_schedule_loop(&self, manager: &StackfulCoroutineManager) {
        self.ensure_coroutine_switch_enabled();
        self.ensure_current_on_this_worker();

        let mut runnables = self.runnables.lock();
        if runnables.is_empty() {
            return;
        }
        let has_fiber_loop = self
            .schedule_loop()
            .map(|co| co.has_native_entrypoint())
            .unwrap_or(false);
        if !has_fiber_loop || runnables.len() != 1 {
            crate::fatal!(
                "{}: expected only the fiber schedule loop, found {:?}",
                self.name,
                runnables.names()
            );
        }

        let current = self.current_coroutine();
        if current.status() != CoroutineStatus::AwaitLoop {
            current.context().request_suspend(false);
        }
        self.push_locked(&mut runnables, current, false);
        self.switch_to_next(runnables, None);
        self.finalize_terminated_coroutines(manager);
    }

    /// 回收终结队列中的协程
    pub(crate) fn finalize_terminated_coroutines(&self, manager: &StackfulCoroutineManager) {
        loop {
            let Some(co) = self.finalization_queue.lock().pop_front() else {
                break;
            };
            manager.destroy_entrypointful_coroutine(co);
        }
    }

    fn suspend_current_and_schedule_next(
        &self,
        manager: &StackfulCoroutineManager,
        mut runnables: MutexGuard<'_, RunnableQueue>,
    ) {
        let current = self.current_coroutine();
        current.context().request_suspend(false);
        self.push_locked(&mut runnables, current, false);
        self.switch_to_next(runnables, None);
        // 被重新调度回来
        self.finalize_terminated_coroutines(manager);
    }

    /// 弹出下一个协程并切换过去
    ///
    /// 所有锁在切换前释放；本函数在当前协程被再次调度时才返回。
    fn switch_to_next(
        &self,
        mut runnables: MutexGuard<'_, RunnableQueue>,
        waiters: Option<MutexGuard<'_, Waiters>>,
    ) {
        let Some(next) = self.pop_locked(&mut runnables) else {
            crate::fatal!("{}: no runnable coroutine to switch to", self.name);
        };
        let from: *const CoroutineContext = {
            let current = self.current_coroutine();
            current.context() as *const CoroutineContext
        };
        if next.status() != CoroutineStatus::AwaitLoop {
            next.context().request_resume();
        }
        let to: *const CoroutineContext = next.context();
        trace!(worker = %self.name, next = %next.name(), "switching");

        binding::set_current(Some(next));
        drop(runnables);
        drop(waiters);

        self.ensure_coroutine_switch_enabled();
        self.switch_count.fetch_add(1, Ordering::Relaxed);
        // SAFETY: `from` 是本线程正在执行的上下文；`to` 刚从本 worker 的队列弹出，处于挂起状态，
        // 只有本线程会恢复它。两个协程分别由 TLS/队列/等待表/终结队列/manager 持有，切换期间存活。
        unsafe { (*from).switch_to(&*to) };
    }

    fn current_coroutine(&self) -> Arc<Coroutine> {
        match binding::current_coroutine() {
            Some(co) => co,
            None => crate::fatal!("{}: no current coroutine on this thread", self.name),
        }
    }

    fn ensure_current_on_this_worker(&self) {
        let worker = self.current_coroutine().worker();
        if worker != Some(self.id) {
            crate::fatal!("{}: current coroutine belongs to worker {:?}", self.name, worker);
        }
    }

    // ========================================================================
    // 切换保护
    // ========================================================================

    /// 禁止协程切换（可嵌套）
    pub fn disable_coroutine_switch(&self) {
        let counter = self.disable_switch_counter.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(worker = %self.name, counter, "coroutine switch disabled");
    }

    /// 恢复协程切换
    pub fn enable_coroutine_switch(&self) {
        let updated = self
            .disable_switch_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        match updated {
            Ok(previous) => {
                debug!(worker = %self.name, counter = previous - 1, "coroutine switch enabled");
            }
            Err(_) => crate::fatal!("{}: unmatched enable of coroutine switch", self.name),
        }
    }

    /// 是否禁止了协程切换
    #[inline]
    pub fn is_coroutine_switch_disabled(&self) -> bool {
        self.disable_switch_counter.load(Ordering::Acquire) > 0
    }

    fn ensure_coroutine_switch_enabled(&self) {
        if self.is_coroutine_switch_disabled() {
            crate::fatal!(
                "trying to switch coroutines on {} when coroutine switch is disabled",
                self.name
            );
        }
    }

    // ========================================================================
    // 调度循环
    // ========================================================================

    /// 调度循环
    pub(crate) fn schedule_loop_body(&self, manager: &StackfulCoroutineManager) {
        while self.is_active() {
            self.request_schedule(manager);
            let runnables = self.runnables.lock();
            self.load_factor.update(runnables.len());
        }
    }

    /// 线程型调度循环的线程函数
    pub(crate) fn thread_proc(&self, manager: Arc<StackfulCoroutineManager>) {
        let Some(schedule_loop) = self.schedule_loop() else {
            crate::fatal!("{}: thread started without a schedule loop", self.name);
        };
        schedule_loop.context().set_worker(self.id);
        schedule_loop.context().request_resume();
        binding::bind(Arc::clone(&manager), Arc::clone(&schedule_loop));
        debug!(worker = %self.name, "schedule loop started");

        self.schedule_loop_body(&manager);

        manager.destroy_entrypointless_coroutine(&schedule_loop);
        binding::unbind();
        debug!(worker = %self.name, "schedule loop stopped");
        manager.on_worker_shutdown();
    }
}

/// fiber 调度循环的 native 入口，参数是 worker 下标
pub(crate) fn schedule_loop_proxy(manager: &StackfulCoroutineManager, param: &NativeParam) {
    let Some(&worker) = param.downcast_ref::<usize>() else {
        crate::fatal!("schedule loop parameter is not a worker index");
    };
    let worker = manager.worker(worker);
    debug!(worker = %worker.name(), "schedule loop called");
    worker.schedule_loop_body(manager);
}

impl std::fmt::Debug for StackfulCoroutineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackfulCoroutineWorker")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("loop_type", &self.loop_type)
            .field("active", &self.is_active())
            .field("load_factor", &self.load_factor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::CoroutineContext;
    use crate::runtime::coroutine::{CoroutineId, CoroutineType};
    use crate::runtime::manager::CoroutineManagerConfig;

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
    fn test_add_runnable_sets_worker() {
        let worker = StackfulCoroutineWorker::new(2, "worker 2", ScheduleLoopType::Thread);
        let co = make_test_coroutine(1);
        worker.add_runnable_coroutine(Arc::clone(&co), false);
        assert_eq!(co.worker(), Some(2));
        assert_eq!(worker.runnables_len(), 1);
        assert_eq!(worker.load_factor(), 0.5);
    }

    #[test]
    fn test_fifo_and_prioritized_order() {
        let worker = StackfulCoroutineWorker::new(0, "worker 0", ScheduleLoopType::Fiber);
        worker.add_runnable_coroutine(make_test_coroutine(1), false);
        worker.add_runnable_coroutine(make_test_coroutine(2), false);
        worker.add_runnable_coroutine(make_test_coroutine(3), true);
        assert_eq!(worker.runnable_names(), vec!["co_3", "co_1", "co_2"]);
    }

    #[test]
    fn test_unblock_without_waiter_is_noop() {
        let worker = StackfulCoroutineWorker::new(1, "worker 1", ScheduleLoopType::Thread);
        let event = CoroutineEvent::new();
        event.set_happened();
        worker.unblock_waiters(&event);
        assert_eq!(worker.runnables_len(), 0);
    }

    #[test]
    fn test_unblock_moves_waiter_to_runnables() {
        let worker = StackfulCoroutineWorker::new(1, "worker 1", ScheduleLoopType::Thread);
        let event = CoroutineEvent::new();
        let co = make_test_coroutine(5);
        co.context().attach_to_coroutine(false, crate::runtime::binding::coroutine_trampoline);
        co.context().request_resume();
        co.context().request_suspend(true);
        worker.waiters.lock().insert(event.id(), Arc::clone(&co));

        event.set_happened();
        worker.unblock_waiters(&event);
        assert_eq!(co.status(), CoroutineStatus::Runnable);
        assert_eq!(worker.runnable_names(), vec!["co_5"]);
        assert!(worker.waiter_names().is_empty());
    }

    #[test]
    fn test_finalization_queue_keeps_coroutine_until_drained() {
        let manager = StackfulCoroutineManager::new(CoroutineManagerConfig::default().with_workers(1));
        let worker = StackfulCoroutineWorker::new(0, "worker 0", ScheduleLoopType::Fiber);
        let co = make_test_coroutine(9);
        let weak = Arc::downgrade(&co);

        worker.finalization_queue.lock().push_back(co);
        assert_eq!(worker.finalization_len(), 1);
        assert!(weak.upgrade().is_some());

        worker.finalize_terminated_coroutines(&manager);
        assert_eq!(worker.finalization_len(), 0);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_switch_guard_nesting() {
        let worker = StackfulCoroutineWorker::new(0, "worker 0", ScheduleLoopType::Fiber);
        assert!(!worker.is_coroutine_switch_disabled());
        worker.disable_coroutine_switch();
        worker.disable_coroutine_switch();
        worker.enable_coroutine_switch();
        assert!(worker.is_coroutine_switch_disabled());
        worker.enable_coroutine_switch();
        assert!(!worker.is_coroutine_switch_disabled());
    }

    #[test]
    #[should_panic(expected = "unmatched enable")]
    fn test_unmatched_enable_is_fatal() {
        let worker = StackfulCoroutineWorker::new(0, "worker 0", ScheduleLoopType::Fiber);
        worker.enable_coroutine_switch();
    }

    #[test]
    fn test_set_active_wakes_waiting_loop() {
        let worker = Arc::new(StackfulCoroutineWorker::new(1, "worker 1", ScheduleLoopType::Thread));
        let waiting = Arc::clone(&worker);
        let handle = std::thread::spawn(move || {
            let runnables = waiting.runnables.lock();
            waiting.wait_for_runnables(runnables);
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        worker.set_active(false);
        handle.join().unwrap();
        assert!(!worker.is_active());
    }
}
