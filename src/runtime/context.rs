//! 协程执行上下文
//!
//! 持有协程的栈和寄存器快照，负责状态迁移与上下文切换

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use super::coroutine::CoroutineStatus;
use super::fiber::{self, FiberRegisters};
use super::stack::{Stack, StackInfo};

/// 未分配 worker
const NO_WORKER: usize = usize::MAX;

/// 协程执行上下文
///
/// 栈由 manager 分配后交给上下文；"裸"上下文（主协程、线程型调度循环）没有自己的栈，
/// 运行在所属 OS 线程的原生栈上。
pub struct CoroutineContext {
    /// 协程栈（裸上下文为 None）
    stack: Option<Stack>,
    /// 寄存器快照
    registers: UnsafeCell<FiberRegisters>,
    /// 协程状态
    status: AtomicU8,
    /// 所属 worker 的下标
    worker: AtomicUsize,
    /// 是否已绑定到协程
    attached: AtomicBool,
}

impl CoroutineContext {
    /// 创建上下文
    ///
    /// 不分配任何内存；栈由调用方提供。
    pub fn new(stack: Option<Stack>) -> Self {
        Self {
            stack,
            registers: UnsafeCell::new(FiberRegisters::new()),
            status: AtomicU8::new(CoroutineStatus::Created as u8),
            worker: AtomicUsize::new(NO_WORKER),
            attached: AtomicBool::new(false),
        }
    }

    /// 绑定到协程
    ///
    /// 有入口的协程把入口指向协程跳板，第一次被切入时执行入口。
    pub fn attach_to_coroutine(&self, has_entrypoint: bool, trampoline: extern "C" fn() -> !) {
        if self.attached.swap(true, Ordering::AcqRel) {
            crate::fatal!("coroutine context is already attached");
        }
        if has_entrypoint {
            let Some(stack) = self.stack.as_ref() else {
                crate::fatal!("entrypoint coroutine context has no stack");
            };
            // SAFETY: 上下文尚未运行，快照只被当前线程访问；栈归本上下文所有
            unsafe { (*self.registers.get()).prepare(stack.top(), trampoline) };
        }
        self.set_status(CoroutineStatus::Runnable);
    }

    /// 解除绑定（协程回到对象池）
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    /// 是否已绑定
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// 切换到 `target`
    ///
    /// 保存当前执行状态到自己的快照，恢复 `target`。只有当别的上下文再切回来时才返回。
    ///
    /// # Safety
    ///
    /// `self` 必须是当前线程正在执行的上下文；`target` 必须已挂起，且不在其他线程上执行。
    /// 两个上下文在切换期间都必须保持存活。
    pub unsafe fn switch_to(&self, target: &CoroutineContext) {
        // SAFETY: 由调用方保证
        unsafe { fiber::switch(self.registers.get(), target.registers.get()) };
    }

    /// 在本上下文的栈上执行 `f`，不破坏已保存的快照
    ///
    /// # Safety
    ///
    /// 本上下文必须已挂起，并且在调用期间不会被任何线程恢复。
    pub unsafe fn remote_call<F: FnOnce()>(&self, f: F) {
        // SAFETY: 上下文已挂起，快照不会被并发写入
        let snapshot = unsafe { (*self.registers.get()).clone() };
        if !snapshot.is_captured() {
            crate::fatal!("remote call into a context that has never been suspended");
        }
        // SAFETY: 由调用方保证
        unsafe { fiber::remote_call(&snapshot, f) };
    }

    /// 销毁裸上下文
    ///
    /// 只能由当前正在执行的、没有入口的上下文调用。
    pub fn destroy(&self, is_current: bool, has_entrypoint: bool) {
        if has_entrypoint {
            crate::fatal!("a coroutine with an entrypoint cannot destroy its own context");
        }
        if !is_current {
            crate::fatal!("only the current context can destroy itself");
        }
        self.set_status(CoroutineStatus::Finished);
        self.detach();
    }

    /// 栈信息
    ///
    /// 裸上下文返回 None：它的栈边界由 OS 线程决定。
    pub fn retrieve_stack_info(&self) -> Option<StackInfo> {
        self.stack.as_ref().map(Stack::info)
    }

    /// 是否有自己的栈
    #[inline]
    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// 保存的栈指针（仅用于诊断）
    pub fn saved_stack_pointer(&self) -> usize {
        // SAFETY: 只读一个字，诊断用途可以接受读到旧值
        unsafe { (*self.registers.get()).stack_pointer() }
    }

    // ------------------------------------------------------------------------
    // 状态迁移（不切换上下文）
    // ------------------------------------------------------------------------

    /// 获取状态
    #[inline]
    pub fn status(&self) -> CoroutineStatus {
        CoroutineStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置状态
    #[inline]
    pub fn set_status(&self, status: CoroutineStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 请求挂起：阻塞时进入 BLOCKED，否则回到 RUNNABLE
    pub fn request_suspend(&self, gets_blocked: bool) {
        if self.status() != CoroutineStatus::Running {
            crate::fatal!("suspending a coroutine in status {:?}", self.status());
        }
        self.set_status(if gets_blocked {
            CoroutineStatus::Blocked
        } else {
            CoroutineStatus::Runnable
        });
    }

    /// 请求恢复运行
    pub fn request_resume(&self) {
        self.set_status(CoroutineStatus::Running);
    }

    /// 请求解除阻塞
    pub fn request_unblock(&self) {
        if self
            .status
            .compare_exchange(
                CoroutineStatus::Blocked as u8,
                CoroutineStatus::Runnable as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            crate::fatal!("unblocking a coroutine in status {:?}", self.status());
        }
    }

    // ------------------------------------------------------------------------
    // worker 归属
    // ------------------------------------------------------------------------

    /// 所属 worker
    #[inline]
    pub fn worker(&self) -> Option<usize> {
        match self.worker.load(Ordering::Acquire) {
            NO_WORKER => None,
            id => Some(id),
        }
    }

    /// 设置所属 worker
    ///
    /// 运行中的协程不能换 worker。
    pub fn set_worker(&self, worker: usize) {
        let previous = self.worker.swap(worker, Ordering::AcqRel);
        if previous != worker && previous != NO_WORKER && self.status() == CoroutineStatus::Running {
            crate::fatal!("moving a running coroutine from worker {} to {}", previous, worker);
        }
    }
}

impl std::fmt::Debug for CoroutineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineContext")
            .field("status", &self.status())
            .field("worker", &self.worker())
            .field("stack", &self.retrieve_stack_info())
            .finish()
    }
}

// SAFETY: 快照只由执行该上下文的线程写入；同一时刻只有一个线程在一个上下文上执行，
// 上下文在 worker 之间的移动发生在它不运行时，由 worker 的队列锁同步。
unsafe impl Send for CoroutineContext {}
unsafe impl Sync for CoroutineContext {}
