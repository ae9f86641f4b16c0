//! 错误类型
//!
//! 只有"预期内"的失败才以 `Result` 返回；调度器不变量被破坏时走 [`fatal!`] 直接终止。

use thiserror::Error;

/// 协程栈分配错误
#[derive(Debug, Error)]
pub enum StackError {
    /// 栈大小不是页大小的整数倍
    #[error("stack size {size} is not a multiple of the page size {page_size}")]
    Misaligned { size: usize, page_size: usize },

    /// mmap 失败
    #[error("failed to map coroutine stack: {0}")]
    Map(#[source] std::io::Error),

    /// 设置保护页失败
    #[error("failed to protect stack guard page: {0}")]
    Protect(#[source] std::io::Error),
}

/// 启动协程失败
#[derive(Debug, Error)]
pub enum LaunchError {
    /// 指定的 worker 组中没有能接收该协程的 worker
    #[error("no suitable worker in group {0:?}")]
    NoSuitableWorker(Vec<usize>),

    /// 协程数量达到上限（由栈内存上限决定）
    #[error("coroutine limit reached ({limit})")]
    CoroutineLimitReached { limit: usize },

    /// 协程栈分配失败
    #[error(transparent)]
    StackAllocation(#[from] StackError),
}

/// 致命错误：记录日志后 panic
///
/// 用于调度器内部不变量被破坏的情况，这类错误说明调度器本身有 bug，不可恢复。
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        panic!($($arg)+)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_display() {
        let err = LaunchError::NoSuitableWorker(vec![1, 2]);
        assert_eq!(err.to_string(), "no suitable worker in group [1, 2]");

        let err = LaunchError::CoroutineLimitReached { limit: 8 };
        assert_eq!(err.to_string(), "coroutine limit reached (8)");
    }

    #[test]
    fn test_stack_error_into_launch_error() {
        let err: LaunchError = StackError::Misaligned { size: 100, page_size: 4096 }.into();
        assert!(matches!(err, LaunchError::StackAllocation(_)));
        assert!(err.to_string().contains("page size 4096"));
    }

    #[test]
    #[should_panic(expected = "broken invariant 7")]
    fn test_fatal_panics() {
        fatal!("broken invariant {}", 7);
    }
}
