//! 协程运行时模块
//!
//! 有栈协程调度子系统：轻量的有栈协程复用在一组 OS 工作线程上
//!
//! 核心组件：
//! - CoroutineContext: 协程的栈和寄存器快照，负责上下文切换
//! - Coroutine: 协程身份（名字、ID、类型）和入口
//! - StackfulCoroutineWorker: 一条调度通道，可运行队列、等待表、终结队列和调度循环
//! - StackfulCoroutineManager: 门面，负责启动、调度、等待、唤醒、终止和关闭

pub mod binding;
pub mod context;
pub mod coroutine;
pub mod event;
mod fiber;
pub mod info;
pub mod manager;
pub mod queue;
pub mod runtime;
pub mod stack;
pub mod worker;

pub use binding::{current_coroutine, current_manager, is_coroutine_thread};
pub use context::CoroutineContext;
pub use coroutine::{
    Coroutine, CoroutineId, CoroutineStatus, CoroutineType, Entrypoint, NativeEntrypointFn,
    NativeParam,
};
pub use event::{CompletionEvent, CoroutineEvent, EventGuard};
pub use info::{CoroutineInfo, CoroutineStateInfo, WorkerInfo};
pub use manager::{CoroutineManagerConfig, StackfulCoroutineManager};
pub use runtime::Runtime;
pub use stack::{Stack, StackInfo};
pub use worker::{ScheduleLoopType, StackfulCoroutineWorker};

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
