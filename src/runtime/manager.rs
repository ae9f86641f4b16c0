//! 有栈协程管理器
//!
//! 协程子系统的门面：协程注册表、协程对象池、worker 集合，
//! 以及启动、调度、等待、唤醒、终止和程序结束的完整流程。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::binding::{self, coroutine_trampoline};
use super::context::CoroutineContext;
use super::coroutine::{
    Coroutine, CoroutineId, CoroutineStatus, CoroutineType, Entrypoint, NativeEntrypointFn,
    NativeParam,
};
use super::event::{CompletionEvent, CoroutineEvent, EventGuard};
use super::stack::{page_size, Stack};
use super::worker::{schedule_loop_proxy, ScheduleLoopType, StackfulCoroutineWorker};
use crate::config::{
    DEFAULT_POOL_LIMIT, DEFAULT_STACK_MEM_LIMIT, DEFAULT_STACK_SIZE_PAGES, ENV_EMULATE_JS,
    ENV_POOL_LIMIT, ENV_STACK_MEM_LIMIT, ENV_STACK_PAGES, ENV_USE_POOL, ENV_WORKERS,
    MAIN_COROUTINE_NAME, MAIN_WORKER_NAME, NATIVE_COROUTINE_NAME, SCHEDULE_LOOP_NAME,
    SUBSYSTEM_NAME,
};
use crate::error::{LaunchError, StackError};
use crate::value::{ManagedMethod, Value};

// ============================================================================
// 配置
// ============================================================================

/// 协程管理器配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoroutineManagerConfig {
    /// worker 数量（包括主 worker；0 表示使用 CPU 核心数）
    pub workers_count: usize,
    /// 每个协程栈的页数
    pub stack_size_pages: usize,
    /// 协程栈总内存上限（字节）
    pub stack_mem_limit: usize,
    /// 是否复用已结束的托管协程
    pub use_pool: bool,
    /// 协程池容量
    pub pool_limit: usize,
    /// 模拟 JS 调度语义：新协程插到队首
    pub emulate_js: bool,
}

impl Default for CoroutineManagerConfig {
    fn default() -> Self {
        Self {
            workers_count: num_cpus::get(),
            stack_size_pages: DEFAULT_STACK_SIZE_PAGES,
            stack_mem_limit: DEFAULT_STACK_MEM_LIMIT,
            use_pool: false,
            pool_limit: DEFAULT_POOL_LIMIT,
            emulate_js: false,
        }
    }
}

impl CoroutineManagerConfig {
    /// 从环境变量加载，未设置或无法解析的项使用默认值
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let workers_count = std::env::var(ENV_WORKERS)
            .ok()
            .and_then(|s| match s.trim() {
                "auto" => Some(0),
                v => v.parse().ok(),
            })
            .unwrap_or(defaults.workers_count);

        let stack_size_pages = std::env::var(ENV_STACK_PAGES)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(defaults.stack_size_pages);

        let stack_mem_limit = std::env::var(ENV_STACK_MEM_LIMIT)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(defaults.stack_mem_limit);

        let use_pool = std::env::var(ENV_USE_POOL)
            .ok()
            .and_then(|s| parse_flag(&s))
            .unwrap_or(defaults.use_pool);

        let pool_limit = std::env::var(ENV_POOL_LIMIT)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.pool_limit);

        let emulate_js = std::env::var(ENV_EMULATE_JS)
            .ok()
            .and_then(|s| parse_flag(&s))
            .unwrap_or(defaults.emulate_js);

        Self {
            workers_count,
            stack_size_pages,
            stack_mem_limit,
            use_pool,
            pool_limit,
            emulate_js,
        }
    }

    /// 设置 worker 数量
    pub fn with_workers(mut self, workers_count: usize) -> Self {
        self.workers_count = workers_count;
        self
    }

    /// 设置协程栈页数
    pub fn with_stack_size_pages(mut self, pages: usize) -> Self {
        self.stack_size_pages = pages;
        self
    }

    /// 设置协程栈总内存上限
    pub fn with_stack_mem_limit(mut self, bytes: usize) -> Self {
        self.stack_mem_limit = bytes;
        self
    }

    /// 启用协程池
    pub fn with_pool(mut self, pool_limit: usize) -> Self {
        self.use_pool = true;
        self.pool_limit = pool_limit;
        self
    }

    /// 设置是否模拟 JS 调度语义
    pub fn with_js_emulation(mut self, emulate_js: bool) -> Self {
        self.emulate_js = emulate_js;
        self
    }

    /// 实际的 worker 数量
    pub fn effective_workers_count(&self) -> usize {
        if self.workers_count == 0 {
            num_cpus::get()
        } else {
            self.workers_count
        }
    }

    /// 协程栈大小（字节）
    pub fn stack_size_bytes(&self) -> usize {
        self.stack_size_pages * page_size()
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// 管理器
// ============================================================================

/// 有栈协程管理器
pub struct StackfulCoroutineManager {
    /// 配置
    config: CoroutineManagerConfig,
    /// 协程栈大小（字节）
    stack_size: usize,
    /// 协程数量上限
    coroutine_count_limit: usize,
    /// 所有 worker（初始化后不再变化）
    workers: OnceLock<Vec<Arc<StackfulCoroutineWorker>>>,
    /// 活跃 worker 数量
    active_workers: Mutex<usize>,
    /// worker 退出时通知
    workers_shutdown_cv: Condvar,
    /// 协程注册表
    registry: DashMap<CoroutineId, Arc<Coroutine>>,
    /// 注册的协程数量
    coroutine_count: AtomicUsize,
    /// 协程对象池
    pool: Mutex<Vec<Arc<Coroutine>>>,
    /// 协程 ID 计数器
    next_id: AtomicU64,
    /// 已分配的协程栈数量
    stacks_allocated: AtomicUsize,
    /// 程序结束检查锁
    program_completion_lock: Mutex<()>,
    /// 程序结束事件（主协程在上面等待其他协程结束）
    program_completion_event: CoroutineEvent,
    /// 主协程
    main_coroutine: Mutex<Option<Arc<Coroutine>>>,
    /// 是否已结束
    finalized: AtomicBool,
}

impl StackfulCoroutineManager {
    /// 创建管理器
    ///
    /// 只计算栈大小和协程数量上限，worker 和主协程在 [`initialize`](Self::initialize) 中创建。
    pub fn new(config: CoroutineManagerConfig) -> Arc<Self> {
        if config.stack_size_pages == 0 {
            crate::fatal!("coroutine stack size should be at least one page");
        }
        let stack_size = config.stack_size_bytes();
        let coroutine_count_limit = config.stack_mem_limit / stack_size;

        Arc::new(Self {
            config,
            stack_size,
            coroutine_count_limit,
            workers: OnceLock::new(),
            active_workers: Mutex::new(0),
            workers_shutdown_cv: Condvar::new(),
            registry: DashMap::new(),
            coroutine_count: AtomicUsize::new(0),
            pool: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stacks_allocated: AtomicUsize::new(0),
            program_completion_lock: Mutex::new(()),
            program_completion_event: CoroutineEvent::new(),
            main_coroutine: Mutex::new(None),
            finalized: AtomicBool::new(false),
        })
    }

    /// 初始化
    ///
    /// 创建 worker（worker 0 使用 fiber 调度循环，其余各启动一个线程），
    /// 并把调用线程绑定为主协程。
    pub fn initialize(self: &Arc<Self>) {
        let count = self.config.effective_workers_count();
        let workers: Vec<_> = (0..count)
            .map(|id| {
                Arc::new(if id == 0 {
                    StackfulCoroutineWorker::new(0, MAIN_WORKER_NAME, ScheduleLoopType::Fiber)
                } else {
                    StackfulCoroutineWorker::new(id, format!("worker {}", id), ScheduleLoopType::Thread)
                })
            })
            .collect();
        if self.workers.set(workers).is_err() {
            crate::fatal!("coroutine manager is already initialized");
        }
        *self.active_workers.lock() = count;

        // 主 worker 的调度循环是一个 native 协程
        let main_worker = self.worker(0);
        let schedule_loop = match self.create_native_coroutine_impl(
            schedule_loop_proxy,
            Arc::new(0usize),
            CoroutineType::ScheduleLoop,
            format!("{}0", SCHEDULE_LOOP_NAME),
        ) {
            Ok(co) => co,
            Err(err) => crate::fatal!("failed to create the main schedule loop: {}", err),
        };
        main_worker.set_schedule_loop(Arc::clone(&schedule_loop));
        main_worker.add_runnable_coroutine(schedule_loop, false);

        for worker in &self.workers()[1..] {
            let schedule_loop = self.create_entrypointless_coroutine(
                format!("{}{}", SCHEDULE_LOOP_NAME, worker.id()),
                CoroutineType::ScheduleLoop,
            );
            worker.set_schedule_loop(schedule_loop);

            let manager = Arc::clone(self);
            let id = worker.id();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", SUBSYSTEM_NAME, id))
                .spawn(move || {
                    let worker = manager.worker(id);
                    worker.thread_proc(Arc::clone(&manager));
                });
            match spawned {
                Ok(handle) => worker.set_thread(handle),
                Err(err) => crate::fatal!("failed to spawn {}: {}", worker.name(), err),
            }
        }

        let main = self.create_entrypointless_coroutine(MAIN_COROUTINE_NAME, CoroutineType::Regular);
        main.context().set_worker(0);
        main.context().request_resume();
        *self.main_coroutine.lock() = Some(Arc::clone(&main));
        binding::bind(Arc::clone(self), main);

        info!(
            workers = count,
            stack_size = self.stack_size,
            coroutine_limit = self.coroutine_count_limit,
            "coroutine manager initialized"
        );
    }

    /// 结束管理器：销毁池中的协程和主协程，解除调用线程的绑定
    ///
    /// 必须在主协程上、[`main_coroutine_completed`](Self::main_coroutine_completed) 之后调用。
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.coroutine_count() > 1 {
            warn!(remaining = self.coroutine_count() - 1, "finalizing with live coroutines");
        }

        let pooled = std::mem::take(&mut *self.pool.lock());
        debug!(pooled = pooled.len(), "destroying pooled coroutines");
        drop(pooled);

        let main = self.main_coroutine.lock().take();
        if let Some(main) = main {
            self.destroy_entrypointless_coroutine(&main);
        }
        binding::unbind();
        info!("coroutine manager finalized");
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 配置
    #[inline]
    pub fn config(&self) -> &CoroutineManagerConfig {
        &self.config
    }

    /// 协程栈大小（字节）
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// 注册的协程数量
    #[inline]
    pub fn coroutine_count(&self) -> usize {
        self.coroutine_count.load(Ordering::Acquire)
    }

    /// 协程数量上限
    #[inline]
    pub fn coroutine_count_limit(&self) -> usize {
        self.coroutine_count_limit
    }

    /// 活跃 worker 数量
    pub fn active_workers_count(&self) -> usize {
        *self.active_workers.lock()
    }

    /// 所有 worker
    pub fn workers(&self) -> &[Arc<StackfulCoroutineWorker>] {
        self.workers.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// 指定下标的 worker
    pub fn worker(&self, id: usize) -> &StackfulCoroutineWorker {
        match self.workers().get(id) {
            Some(worker) => &**worker,
            None => crate::fatal!("no worker with index {}", id),
        }
    }

    /// 当前线程的 worker
    pub fn current_worker(&self) -> &StackfulCoroutineWorker {
        let Some(co) = binding::current_coroutine() else {
            crate::fatal!("current thread has no coroutine");
        };
        let Some(id) = co.worker() else {
            crate::fatal!("current coroutine {} has no worker", co.name());
        };
        self.worker(id)
    }

    /// 主协程
    pub fn main_coroutine(&self) -> Option<Arc<Coroutine>> {
        self.main_coroutine.lock().clone()
    }

    /// 池中的协程数量
    pub fn pool_size(&self) -> usize {
        self.pool.lock().len()
    }

    /// 累计分配的协程栈数量
    pub fn stacks_allocated(&self) -> usize {
        self.stacks_allocated.load(Ordering::Relaxed)
    }

    /// 是否模拟 JS 调度语义
    #[inline]
    pub fn is_js_mode(&self) -> bool {
        self.config.emulate_js
    }

    // ========================================================================
    // 启动
    // ========================================================================

    /// 启动托管协程
    ///
    /// 优先从对象池取协程复用；放到负载因子最小的 worker（相同时取下标最小者）。
    pub fn launch(
        &self,
        completion: Arc<CompletionEvent>,
        method: Arc<dyn ManagedMethod>,
        arguments: Vec<Value>,
    ) -> Result<Arc<Coroutine>, LaunchError> {
        debug!("launch started");
        self.print_current_runnables("launch begin");

        let Some(worker) = self.least_loaded_worker(&[]) else {
            return Err(LaunchError::NoSuitableWorker(Vec::new()));
        };

        let name = method.full_name();
        let entrypoint = Entrypoint::Managed { method, arguments };
        let pooled = if self.config.use_pool {
            self.pool.lock().pop()
        } else {
            None
        };
        let co = match pooled {
            Some(co) => {
                co.reinitialize(self.next_coroutine_id(), name, entrypoint, Some(completion));
                co.context().attach_to_coroutine(true, coroutine_trampoline);
                self.add_to_registry(&co);
                debug!(coroutine = %co.name(), id = %co.id(), "reused a pooled coroutine");
                co
            }
            None => {
                self.check_coroutine_limit()?;
                let stack = self.allocate_stack()?;
                let co = Coroutine::new(
                    self.next_coroutine_id(),
                    name,
                    CoroutineType::Regular,
                    CoroutineContext::new(Some(stack)),
                    Some(entrypoint),
                    Some(completion),
                );
                co.context().attach_to_coroutine(true, coroutine_trampoline);
                self.add_to_registry(&co);
                co
            }
        };

        worker.add_runnable_coroutine(Arc::clone(&co), self.is_js_mode());
        debug!(coroutine = %co.name(), id = %co.id(), worker = %worker.name(), "launch finished");
        self.print_current_runnables("launch end");
        Ok(co)
    }

    /// 在指定 worker 组中启动 native 协程
    ///
    /// `group` 为空表示所有 worker。
    pub fn launch_native(
        &self,
        function: NativeEntrypointFn,
        param: NativeParam,
        group: &[usize],
    ) -> Result<Arc<Coroutine>, LaunchError> {
        let Some(worker) = self.least_loaded_worker(group) else {
            return Err(LaunchError::NoSuitableWorker(group.to_vec()));
        };
        let co = self.create_native_coroutine(function, param)?;
        worker.add_runnable_coroutine(Arc::clone(&co), self.is_js_mode());
        debug!(coroutine = %co.name(), id = %co.id(), worker = %worker.name(), "native coroutine launched");
        Ok(co)
    }

    fn least_loaded_worker(&self, group: &[usize]) -> Option<&StackfulCoroutineWorker> {
        self.workers()
            .iter()
            .filter(|w| w.is_active())
            .filter(|w| group.is_empty() || group.contains(&w.id()))
            .min_by(|a, b| a.load_factor().total_cmp(&b.load_factor()))
            .map(|w| &**w)
    }

    /// 创建 native 协程（不放入任何队列）
    ///
    /// 协程数量达到上限或栈分配失败时返回错误。
    pub fn create_native_coroutine(
        &self,
        function: NativeEntrypointFn,
        param: NativeParam,
    ) -> Result<Arc<Coroutine>, LaunchError> {
        self.create_native_coroutine_impl(
            function,
            param,
            CoroutineType::NativeUtility,
            NATIVE_COROUTINE_NAME.to_string(),
        )
    }

    fn create_native_coroutine_impl(
        &self,
        function: NativeEntrypointFn,
        param: NativeParam,
        kind: CoroutineType,
        name: String,
    ) -> Result<Arc<Coroutine>, LaunchError> {
        self.check_coroutine_limit()?;
        let stack = self.allocate_stack()?;
        let co = Coroutine::new(
            self.next_coroutine_id(),
            name,
            kind,
            CoroutineContext::new(Some(stack)),
            Some(Entrypoint::Native { function, param }),
            None,
        );
        co.context().attach_to_coroutine(true, coroutine_trampoline);
        self.add_to_registry(&co);
        Ok(co)
    }

    /// 销毁从未进入队列或已经结束的 native 协程
    ///
    /// 已交给 worker 且尚未结束的协程（包括还在可运行队列里的）不能销毁。
    pub fn destroy_native_coroutine(&self, co: Arc<Coroutine>) {
        if !co.has_native_entrypoint() {
            crate::fatal!("{} is not a native coroutine", co.name());
        }
        let status = co.status();
        if let Some(worker) = co.worker() {
            if status != CoroutineStatus::Finished {
                crate::fatal!(
                    "destroying native coroutine {} owned by worker {} in status {:?}",
                    co.name(),
                    worker,
                    status
                );
            }
        }
        self.remove_from_registry(&co);
        co.set_status(CoroutineStatus::Finished);
        co.context().detach();
        debug!(coroutine = %co.name(), id = %co.id(), "native coroutine destroyed");
    }

    fn create_entrypointless_coroutine(&self, name: impl Into<String>, kind: CoroutineType) -> Arc<Coroutine> {
        let co = Coroutine::new(
            self.next_coroutine_id(),
            name,
            kind,
            CoroutineContext::new(None),
            None,
            None,
        );
        co.context().attach_to_coroutine(false, coroutine_trampoline);
        self.add_to_registry(&co);
        co
    }

    /// 销毁没有入口的协程（主协程、线程型调度循环），只能在它自己的线程上调用
    pub(crate) fn destroy_entrypointless_coroutine(&self, co: &Arc<Coroutine>) {
        let is_current = binding::current_coroutine()
            .map(|current| Arc::ptr_eq(&current, co))
            .unwrap_or(false);
        co.context().destroy(is_current, co.has_entrypoint());
        self.remove_from_registry(co);
    }

    /// 回收终结队列中的协程：放回对象池或释放
    pub(crate) fn destroy_entrypointful_coroutine(&self, co: Arc<Coroutine>) {
        if self.config.use_pool && co.has_managed_entrypoint() {
            let mut pool = self.pool.lock();
            if pool.len() < self.config.pool_limit {
                co.clean_up();
                pool.push(co);
                return;
            }
        }
        debug!(coroutine = %co.name(), id = %co.id(), "coroutine destroyed");
    }

    fn check_coroutine_limit(&self) -> Result<(), LaunchError> {
        if self.coroutine_count() >= self.coroutine_count_limit {
            return Err(LaunchError::CoroutineLimitReached {
                limit: self.coroutine_count_limit,
            });
        }
        Ok(())
    }

    fn allocate_stack(&self) -> Result<Stack, StackError> {
        let stack = Stack::new(self.stack_size)?;
        self.stacks_allocated.fetch_add(1, Ordering::Relaxed);
        Ok(stack)
    }

    fn next_coroutine_id(&self) -> CoroutineId {
        CoroutineId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn add_to_registry(&self, co: &Arc<Coroutine>) {
        self.registry.insert(co.id(), Arc::clone(co));
        self.coroutine_count.fetch_add(1, Ordering::AcqRel);
    }

    fn remove_from_registry(&self, co: &Coroutine) {
        if self.registry.remove(&co.id()).is_some() {
            self.coroutine_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn print_current_runnables(&self, requester: &str) {
        let worker = binding::current_coroutine().and_then(|co| co.worker());
        if let Some(worker) = worker.and_then(|id| self.workers().get(id)) {
            worker.print_runnables(requester);
        }
    }

    // ========================================================================
    // 调度
    // ========================================================================

    /// 让出当前协程
    pub fn schedule(&self) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let name = binding::current_coroutine().map(|co| co.name()).unwrap_or_default();
            debug!(coroutine = %name, "schedule requested");
        }
        self.current_worker().request_schedule(self);
    }

    /// 等待事件
    ///
    /// 调用方先 `event.lock()`，再把 guard 交进来。事件已发生时立即返回 false；
    /// 否则当前协程阻塞，直到 [`unblock_waiters`](Self::unblock_waiters) 唤醒它，返回 true。
    pub fn await_event(&self, event: &CoroutineEvent, guard: EventGuard<'_>) -> bool {
        if !event.owns(&guard) {
            crate::fatal!("await on event {} with a guard of another event", event.id());
        }
        let waiter = binding::current_coroutine().map(|co| co.name()).unwrap_or_default();
        debug!(coroutine = %waiter, event = event.id(), "await started");
        if !self.current_worker().wait_for_event(self, event, guard) {
            debug!(coroutine = %waiter, event = event.id(), "await finished (no await happened)");
            return false;
        }
        debug!(coroutine = %waiter, event = event.id(), "await finished");
        true
    }

    /// 唤醒等待该事件的协程
    ///
    /// 事件必须已经发生。唤醒分发给事件记录的每个有等待者的 worker。
    pub fn unblock_waiters(&self, event: &CoroutineEvent) {
        let hosts = {
            let mut state = event.lock();
            debug_assert!(state.happened(), "unblocking waiters of an event that has not happened");
            state.take_host_workers()
        };
        for id in hosts {
            self.worker(id).unblock_waiters(event);
        }
    }

    /// 终止协程
    ///
    /// 有入口的协程交给终结队列并切走，永不返回；没有入口的协程（如主协程）需要手动销毁，返回 false。
    pub fn terminate_coroutine(&self, co: Arc<Coroutine>) -> bool {
        debug!(coroutine = %co.name(), id = %co.id(), "terminate started");
        co.set_status(CoroutineStatus::Terminating);
        self.remove_from_registry(&co);
        co.set_status(CoroutineStatus::Finished);

        if co.has_managed_entrypoint() {
            if let Some(completion) = co.completion_event() {
                self.unblock_waiters(completion.event());
            }
            self.check_program_completion();
            self.current_worker().request_finalization(co)
        } else if co.has_native_entrypoint() {
            if co.kind() != CoroutineType::ScheduleLoop {
                self.check_program_completion();
            }
            self.current_worker().request_finalization(co)
        } else {
            false
        }
    }

    fn check_program_completion(&self) {
        let _completion = self.program_completion_lock.lock();
        let active = self.active_workers_count();
        let count = self.coroutine_count();
        // 1 是主协程，每个活跃 worker 还有一个调度循环
        if count == 1 + active {
            debug!("all coroutines finished execution");
            self.program_completion_event.set_happened();
            self.unblock_waiters(&self.program_completion_event);
        } else {
            debug!(remaining = count.saturating_sub(1 + active), "coroutines still exist");
        }
    }

    /// 主协程执行完毕
    ///
    /// 等待其他协程全部结束，停止所有 worker，最后让主 worker 的 fiber 调度循环退出。
    pub fn main_coroutine_completed(&self) {
        debug!("main coroutine completed: waiting for other coroutines");
        {
            let mut completion = self.program_completion_lock.lock();
            while self.coroutine_count() > 1 + self.active_workers_count() {
                let mut guard = self.program_completion_event.lock();
                guard.set_not_happened();
                drop(completion);
                self.current_worker()
                    .wait_for_event(self, &self.program_completion_event, guard);
                debug!("possibly spurious wakeup from program completion wait");
                completion = self.program_completion_lock.lock();
            }
        }

        if let Some(main) = binding::current_coroutine() {
            main.set_status(CoroutineStatus::AwaitLoop);
        }

        debug!("main coroutine completed: stopping workers");
        {
            let mut active = self.active_workers.lock();
            for worker in self.workers() {
                worker.set_active(false);
            }
            // 1 是主 worker
            while *active > 1 {
                self.workers_shutdown_cv.wait(&mut active);
            }
        }
        for worker in self.workers() {
            worker.join();
        }

        debug!("main coroutine completed: stopping the main schedule loop");
        while self.coroutine_count() > 1 {
            self.current_worker().finalize_fiber_schedule_loop(self);
        }
        debug!("main coroutine completed: done");
    }

    /// worker 线程退出时调用
    pub(crate) fn on_worker_shutdown(&self) {
        let mut active = self.active_workers.lock();
        *active -= 1;
        self.workers_shutdown_cv.notify_all();
        debug!(workers_left = *active, "worker shutdown completed");
    }

    // ========================================================================
    // 切换保护
    // ========================================================================

    /// 在当前 worker 上禁止协程切换
    pub fn disable_coroutine_switch(&self) {
        self.current_worker().disable_coroutine_switch();
    }

    /// 在当前 worker 上恢复协程切换
    pub fn enable_coroutine_switch(&self) {
        self.current_worker().enable_coroutine_switch();
    }

    /// 当前 worker 是否禁止了协程切换
    pub fn is_coroutine_switch_disabled(&self) -> bool {
        self.current_worker().is_coroutine_switch_disabled()
    }

    // ========================================================================
    // 跨上下文执行
    // ========================================================================

    /// 在已挂起的协程 `co` 的栈上执行 `f`
    ///
    /// `co` 必须属于当前 worker 且不在运行。`f` 执行期间禁止协程切换。
    pub fn remote_call<F: FnOnce()>(&self, co: &Coroutine, f: F) {
        let worker = self.current_worker();
        if co.worker() != Some(worker.id()) {
            crate::fatal!("remote call into {} owned by worker {:?}", co.name(), co.worker());
        }
        match co.status() {
            CoroutineStatus::Runnable | CoroutineStatus::Blocked => {}
            status => crate::fatal!("remote call into {} in status {:?}", co.name(), status),
        }

        worker.disable_coroutine_switch();
        // SAFETY: co 已挂起且归当前 worker 所有，只有本线程能恢复它，而 f 执行期间切换被禁止
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { co.context().remote_call(f) }));
        worker.enable_coroutine_switch();
        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }

    // ========================================================================
    // GC 接口
    // ========================================================================

    /// 遍历所有注册的协程，回调返回 false 时停止并返回 false
    ///
    /// 回调中不能启动或终止协程。
    pub fn enumerate_coroutines<F>(&self, mut cb: F) -> bool
    where
        F: FnMut(&Arc<Coroutine>) -> bool,
    {
        for entry in self.registry.iter() {
            if !cb(entry.value()) {
                return false;
            }
        }
        true
    }

    /// 暂停所有协程（stop-the-world 计数）
    pub fn suspend_all_coroutines(&self) {
        debug!("suspend all coroutines started");
        for entry in self.registry.iter() {
            entry.value().suspend_impl();
        }
        debug!("suspend all coroutines finished");
    }

    /// 恢复所有协程
    pub fn resume_all_coroutines(&self) {
        for entry in self.registry.iter() {
            entry.value().resume_impl();
        }
    }
}

impl std::fmt::Debug for StackfulCoroutineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackfulCoroutineManager")
            .field("workers", &self.workers().len())
            .field("active_workers", &self.active_workers_count())
            .field("coroutine_count", &self.coroutine_count())
            .field("coroutine_count_limit", &self.coroutine_count_limit)
            .field("pool_size", &self.pool_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CoroutineManagerConfig::default();
        assert_eq!(config.workers_count, num_cpus::get());
        assert_eq!(config.stack_size_pages, DEFAULT_STACK_SIZE_PAGES);
        assert!(!config.use_pool);
        assert!(!config.emulate_js);
    }

    #[test]
    fn test_config_builder() {
        let config = CoroutineManagerConfig::default()
            .with_workers(3)
            .with_stack_size_pages(8)
            .with_stack_mem_limit(1 << 20)
            .with_pool(16)
            .with_js_emulation(true);
        assert_eq!(config.effective_workers_count(), 3);
        assert_eq!(config.stack_size_bytes(), 8 * page_size());
        assert!(config.use_pool);
        assert_eq!(config.pool_limit, 16);
        assert!(config.emulate_js);
    }

    #[test]
    fn test_config_auto_workers() {
        let config = CoroutineManagerConfig::default().with_workers(0);
        assert_eq!(config.effective_workers_count(), num_cpus::get());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_coroutine_count_limit() {
        let config = CoroutineManagerConfig::default()
            .with_workers(1)
            .with_stack_size_pages(4)
            .with_stack_mem_limit(page_size() * 4 * 10);
        let manager = StackfulCoroutineManager::new(config);
        assert_eq!(manager.coroutine_count_limit(), 10);
        assert_eq!(manager.stack_size(), page_size() * 4);
        assert_eq!(manager.coroutine_count(), 0);
        assert!(manager.workers().is_empty());
    }

    #[test]
    fn test_create_native_coroutine_respects_limit() {
        fn noop(_: &StackfulCoroutineManager, _: &NativeParam) {}

        let config = CoroutineManagerConfig::default()
            .with_workers(1)
            .with_stack_size_pages(1)
            .with_stack_mem_limit(page_size() * 2);
        let manager = StackfulCoroutineManager::new(config);

        let a = manager.create_native_coroutine(noop, Arc::new(())).unwrap();
        let b = manager.create_native_coroutine(noop, Arc::new(())).unwrap();
        let err = manager.create_native_coroutine(noop, Arc::new(())).unwrap_err();
        assert!(matches!(err, LaunchError::CoroutineLimitReached { limit: 2 }));
        assert_eq!(manager.coroutine_count(), 2);
        assert_eq!(manager.stacks_allocated(), 2);
        assert_eq!(a.status(), CoroutineStatus::Runnable);
        assert_eq!(a.kind(), CoroutineType::NativeUtility);

        manager.destroy_native_coroutine(a);
        manager.destroy_native_coroutine(b);
        assert_eq!(manager.coroutine_count(), 0);
        assert!(manager.create_native_coroutine(noop, Arc::new(())).is_ok());
    }

    #[test]
    fn test_launch_native_unknown_group() {
        fn noop(_: &StackfulCoroutineManager, _: &NativeParam) {}

        let manager = StackfulCoroutineManager::new(CoroutineManagerConfig::default().with_workers(1));
        let err = manager.launch_native(noop, Arc::new(()), &[5]).unwrap_err();
        assert!(matches!(err, LaunchError::NoSuitableWorker(ref group) if group == &vec![5]));
        assert_eq!(manager.coroutine_count(), 0);
    }
}
