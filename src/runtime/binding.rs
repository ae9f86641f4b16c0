//! 线程绑定
//!
//! 每个参与调度的 OS 线程在线程局部存储里记录它所属的 manager 和当前协程。
//! 协程跳板也在这里：新协程第一次被切入时从跳板开始执行。

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use super::coroutine::{Coroutine, Entrypoint};
use super::manager::StackfulCoroutineManager;

thread_local! {
    /// 本线程绑定的 manager
    static MANAGER: RefCell<Option<Arc<StackfulCoroutineManager>>> = const { RefCell::new(None) };
    /// 本线程当前执行的协程
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

/// 把当前线程绑定到 manager，并设置当前协程
pub(crate) fn bind(manager: Arc<StackfulCoroutineManager>, current: Arc<Coroutine>) {
    MANAGER.with(|m| {
        let mut m = m.borrow_mut();
        if m.is_some() {
            crate::fatal!("thread {:?} is already bound to a coroutine manager", std::thread::current().id());
        }
        *m = Some(manager);
    });
    set_current(Some(current));
}

/// 解除当前线程的绑定
pub(crate) fn unbind() {
    set_current(None);
    let manager = MANAGER.with(|m| m.borrow_mut().take());
    drop(manager);
}

/// 设置当前协程
pub(crate) fn set_current(co: Option<Arc<Coroutine>>) {
    let previous = CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), co));
    drop(previous);
}

/// 当前协程
///
/// 线程没有绑定到 manager 时返回 None。
pub fn current_coroutine() -> Option<Arc<Coroutine>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// 当前线程是否在执行协程
pub fn is_coroutine_thread() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// 当前线程绑定的 manager
pub fn current_manager() -> Option<Arc<StackfulCoroutineManager>> {
    MANAGER.with(|m| m.borrow().clone())
}

/// 以引用方式访问当前线程绑定的 manager
///
/// 不持有 TLS 借用，也不增加引用计数，`f` 里可以切换上下文，包括永不返回的切换。
pub(crate) fn with_current_manager<R>(f: impl FnOnce(&StackfulCoroutineManager) -> R) -> R {
    let ptr = MANAGER.with(|m| m.borrow().as_ref().map(Arc::as_ptr));
    let Some(ptr) = ptr else {
        crate::fatal!("thread {:?} is not bound to a coroutine manager", std::thread::current().id());
    };
    // SAFETY: TLS 中的 Arc 保证 manager 存活，直到本线程调用 unbind；
    // unbind 只在本线程不再执行任何协程时发生
    f(unsafe { &*ptr })
}

/// 协程跳板
///
/// 有入口的协程第一次被切入时从这里开始。执行完入口后交给 manager 终止，永不返回。
pub(crate) extern "C" fn coroutine_trampoline() -> ! {
    with_current_manager(|manager| {
        // 刚从别的上下文切过来，先处理终结队列
        manager.current_worker().finalize_terminated_coroutines(manager);

        let Some(co) = current_coroutine() else {
            crate::fatal!("coroutine trampoline entered without a current coroutine");
        };
        run_entrypoint(manager, &co);

        manager.terminate_coroutine(co);
    });
    crate::fatal!("terminated coroutine has been scheduled again")
}

/// 执行协程入口
///
/// 入口里逃逸出来的 panic 无法跨越上下文切换继续展开，记录后中止进程。
fn run_entrypoint(manager: &StackfulCoroutineManager, co: &Coroutine) {
    let Some(entrypoint) = co.entrypoint() else {
        crate::fatal!("coroutine {} has no entrypoint", co.name());
    };
    debug!(coroutine = %co.name(), id = %co.id(), "entrypoint started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match entrypoint {
        Entrypoint::Managed { method, arguments } => {
            let result = method.invoke(manager, &arguments);
            co.request_completion(result);
        }
        Entrypoint::Native { function, param } => function(manager, &param),
    }));

    if let Err(payload) = outcome {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());
        error!(coroutine = %co.name(), "panic escaped coroutine entrypoint: {}", message);
        std::process::abort();
    }
    debug!(coroutine = %co.name(), id = %co.id(), "entrypoint finished");
}
