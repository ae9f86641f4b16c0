//! Q 语言运行时的有栈协程调度子系统
//!
//! 协程拥有独立的栈，协作式地运行在一组 worker 上：主 worker 的调度循环本身也是一个协程，
//! 其余 worker 各占一个 OS 线程。公共入口是 [`runtime::Runtime`] 和
//! [`runtime::StackfulCoroutineManager`]。

pub mod config;
pub mod error;
pub mod runtime;
pub mod value;

pub use error::{LaunchError, StackError};
pub use runtime::{
    CompletionEvent, Coroutine, CoroutineEvent, CoroutineManagerConfig, CoroutineStateInfo,
    CoroutineStatus, Runtime, StackfulCoroutineManager,
};
pub use value::{FnMethod, ManagedMethod, Value};
