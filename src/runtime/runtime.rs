//! 运行时入口
//!
//! 持有一个协程管理器：创建时初始化并把当前线程绑定为主协程，结束时执行关闭流程

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::info::CoroutineStateInfo;
use super::manager::{CoroutineManagerConfig, StackfulCoroutineManager};

/// 协程运行时
///
/// 创建它的线程就是主协程所在的线程，因此运行时不能跨线程移动。
pub struct Runtime {
    /// 协程管理器
    manager: Arc<StackfulCoroutineManager>,
    /// 是否正在运行
    running: AtomicBool,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// 创建运行时
    pub fn new(config: CoroutineManagerConfig) -> Self {
        let manager = StackfulCoroutineManager::new(config);
        manager.initialize();
        Self {
            manager,
            running: AtomicBool::new(true),
            _not_send: PhantomData,
        }
    }

    /// 使用环境变量中的配置创建运行时
    pub fn from_env() -> Self {
        Self::new(CoroutineManagerConfig::from_env())
    }

    /// 协程管理器
    #[inline]
    pub fn manager(&self) -> &Arc<StackfulCoroutineManager> {
        &self.manager
    }

    /// 以主协程身份运行 `body`，结束后执行关闭流程
    pub fn run<F, R>(self, body: F) -> R
    where
        F: FnOnce(&StackfulCoroutineManager) -> R,
    {
        let result = body(&self.manager);
        self.shutdown();
        result
    }

    /// 关闭：等待所有协程结束，停止 worker，释放主协程
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.manager.main_coroutine_completed();
        self.manager.finalize();
    }

    /// 是否正在运行
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 状态快照
    pub fn stats(&self) -> CoroutineStateInfo {
        CoroutineStateInfo::capture(&self.manager)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.is_running() {
            return;
        }
        if std::thread::panicking() {
            warn!("runtime dropped during a panic, skipping shutdown");
            return;
        }
        self.shutdown();
    }
}
