//! 配置常量模块
//!
//! 协程子系统中所有可调的默认值和环境变量名都在这里定义，便于后期修改

/// 子系统名称（用于线程名和日志）
pub const SUBSYSTEM_NAME: &str = "qcoro";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 默认协程栈大小（页）
pub const DEFAULT_STACK_SIZE_PAGES: usize = 64;

/// 默认协程栈内存上限（字节），决定协程数量上限
pub const DEFAULT_STACK_MEM_LIMIT: usize = 1024 * 1024 * 1024;

/// 默认协程池容量
pub const DEFAULT_POOL_LIMIT: usize = 1024;

/// 主 worker 的名字
pub const MAIN_WORKER_NAME: &str = "[main] worker 0";

/// 主协程的名字
pub const MAIN_COROUTINE_NAME: &str = "_main_";

/// native 协程的默认名字
pub const NATIVE_COROUTINE_NAME: &str = "_native_coro_";

/// 调度循环协程名字前缀
pub const SCHEDULE_LOOP_NAME: &str = "_schedule_loop_";

// ============================================================================
// 环境变量
// ============================================================================

/// worker 数量（"auto" 或正整数）
pub const ENV_WORKERS: &str = "QCORO_WORKERS";

/// 每个协程栈的页数
pub const ENV_STACK_PAGES: &str = "QCORO_STACK_PAGES";

/// 协程栈总内存上限（字节）
pub const ENV_STACK_MEM_LIMIT: &str = "QCORO_STACK_MEM_LIMIT";

/// 是否启用协程池（1/0, true/false）
pub const ENV_USE_POOL: &str = "QCORO_USE_POOL";

/// 协程池容量
pub const ENV_POOL_LIMIT: &str = "QCORO_POOL_LIMIT";

/// 是否模拟 JS 调度语义（新协程插到队首）
pub const ENV_EMULATE_JS: &str = "QCORO_EMULATE_JS";
