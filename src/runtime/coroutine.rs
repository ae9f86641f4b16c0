//! 协程 (Coroutine) 结构
//!
//! 协程是调度的基本单位：对外可见的身份（名字、ID、类型）、入口，以及它独占的执行上下文

use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::context::CoroutineContext;
use super::event::CompletionEvent;
use crate::value::{ManagedMethod, Value};

/// 协程 ID
///
/// 对外使用的句柄；协程从对象池复用时会分配新的 ID。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(pub u64);

impl std::fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 协程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoroutineStatus {
    /// 已创建，尚未绑定上下文
    Created = 0,
    /// 可运行，等待被调度
    Runnable = 1,
    /// 正在运行
    Running = 2,
    /// 阻塞在某个事件上
    Blocked = 3,
    /// 入口已执行完，正在终止
    Terminating = 4,
    /// 已结束
    Finished = 5,
    /// 主协程执行完毕，但线程仍在服务调度循环
    AwaitLoop = 6,
}

impl From<u8> for CoroutineStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => CoroutineStatus::Created,
            1 => CoroutineStatus::Runnable,
            2 => CoroutineStatus::Running,
            3 => CoroutineStatus::Blocked,
            4 => CoroutineStatus::Terminating,
            5 => CoroutineStatus::Finished,
            6 => CoroutineStatus::AwaitLoop,
            _ => crate::fatal!("invalid coroutine status byte {}", v),
        }
    }
}

/// 协程类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineType {
    /// 普通协程（包括主协程）
    Regular,
    /// worker 的调度循环
    ScheduleLoop,
    /// 嵌入方创建的 native 工具协程
    NativeUtility,
}

/// native 入口的参数
pub type NativeParam = Arc<dyn Any + Send + Sync>;

/// native 入口函数
pub type NativeEntrypointFn = fn(&super::StackfulCoroutineManager, &NativeParam);

/// 协程入口
#[derive(Clone)]
pub enum Entrypoint {
    /// 托管方法 + 参数
    Managed {
        method: Arc<dyn ManagedMethod>,
        arguments: Vec<Value>,
    },
    /// native 函数 + 不透明参数
    Native {
        function: NativeEntrypointFn,
        param: NativeParam,
    },
}

impl std::fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entrypoint::Managed { method, arguments } => f
                .debug_struct("Managed")
                .field("method", &method.full_name())
                .field("arguments", arguments)
                .finish(),
            Entrypoint::Native { .. } => f.debug_struct("Native").finish_non_exhaustive(),
        }
    }
}

/// 协程
pub struct Coroutine {
    /// 协程 ID（复用时会换新 ID）
    id: AtomicU64,
    /// 协程名
    name: Mutex<String>,
    /// 协程类型
    kind: CoroutineType,
    /// 执行上下文（整个生命周期独占）
    context: CoroutineContext,
    /// 入口（裸协程为 None）
    entrypoint: Mutex<Option<Entrypoint>>,
    /// 完成事件（托管协程）
    completion: Mutex<Option<Arc<CompletionEvent>>>,
    /// 全局暂停计数（stop-the-world）
    suspend_count: AtomicU32,
}

impl Coroutine {
    /// 创建协程
    ///
    /// 上下文此时尚未绑定，状态为 CREATED。
    pub fn new(
        id: CoroutineId,
        name: impl Into<String>,
        kind: CoroutineType,
        context: CoroutineContext,
        entrypoint: Option<Entrypoint>,
        completion: Option<Arc<CompletionEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU64::new(id.0),
            name: Mutex::new(name.into()),
            kind,
            context,
            entrypoint: Mutex::new(entrypoint),
            completion: Mutex::new(completion),
            suspend_count: AtomicU32::new(0),
        })
    }

    /// 重新初始化（从对象池取出复用）
    pub fn reinitialize(
        &self,
        id: CoroutineId,
        name: impl Into<String>,
        entrypoint: Entrypoint,
        completion: Option<Arc<CompletionEvent>>,
    ) {
        self.id.store(id.0, Ordering::Release);
        *self.name.lock() = name.into();
        *self.entrypoint.lock() = Some(entrypoint);
        *self.completion.lock() = completion;
        self.suspend_count.store(0, Ordering::Relaxed);
        self.context.set_status(CoroutineStatus::Created);
    }

    /// 清理（放回对象池之前）
    ///
    /// 释放入口和参数持有的引用，上下文解除绑定，栈保留。
    pub fn clean_up(&self) {
        *self.entrypoint.lock() = None;
        *self.completion.lock() = None;
        self.context.detach();
    }

    /// 协程 ID
    #[inline]
    pub fn id(&self) -> CoroutineId {
        CoroutineId(self.id.load(Ordering::Acquire))
    }

    /// 协程名
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// 协程类型
    #[inline]
    pub fn kind(&self) -> CoroutineType {
        self.kind
    }

    /// 执行上下文
    #[inline]
    pub fn context(&self) -> &CoroutineContext {
        &self.context
    }

    /// 协程状态
    #[inline]
    pub fn status(&self) -> CoroutineStatus {
        self.context.status()
    }

    /// 设置协程状态
    #[inline]
    pub fn set_status(&self, status: CoroutineStatus) {
        self.context.set_status(status);
    }

    /// 所属 worker
    #[inline]
    pub fn worker(&self) -> Option<usize> {
        self.context.worker()
    }

    /// 是否有入口
    pub fn has_entrypoint(&self) -> bool {
        self.entrypoint.lock().is_some()
    }

    /// 是否有托管入口
    pub fn has_managed_entrypoint(&self) -> bool {
        matches!(*self.entrypoint.lock(), Some(Entrypoint::Managed { .. }))
    }

    /// 是否有 native 入口
    pub fn has_native_entrypoint(&self) -> bool {
        matches!(*self.entrypoint.lock(), Some(Entrypoint::Native { .. }))
    }

    /// 托管入口方法
    pub fn managed_entrypoint(&self) -> Option<Arc<dyn ManagedMethod>> {
        match &*self.entrypoint.lock() {
            Some(Entrypoint::Managed { method, .. }) => Some(Arc::clone(method)),
            _ => None,
        }
    }

    /// 托管入口参数
    pub fn managed_entrypoint_arguments(&self) -> Option<Vec<Value>> {
        match &*self.entrypoint.lock() {
            Some(Entrypoint::Managed { arguments, .. }) => Some(arguments.clone()),
            _ => None,
        }
    }

    /// native 入口函数
    pub fn native_entrypoint(&self) -> Option<NativeEntrypointFn> {
        match &*self.entrypoint.lock() {
            Some(Entrypoint::Native { function, .. }) => Some(*function),
            _ => None,
        }
    }

    /// native 入口参数
    pub fn native_entrypoint_param(&self) -> Option<NativeParam> {
        match &*self.entrypoint.lock() {
            Some(Entrypoint::Native { param, .. }) => Some(Arc::clone(param)),
            _ => None,
        }
    }

    /// 入口（克隆一份，执行期间不持有锁）
    pub fn entrypoint(&self) -> Option<Entrypoint> {
        self.entrypoint.lock().clone()
    }

    /// 完成事件
    pub fn completion_event(&self) -> Option<Arc<CompletionEvent>> {
        self.completion.lock().clone()
    }

    /// 请求完成：把结果交给等待者
    pub fn request_completion(&self, result: Value) {
        if let Some(event) = self.completion_event() {
            event.complete(result);
        }
    }

    // ------------------------------------------------------------------------
    // stop-the-world
    // ------------------------------------------------------------------------

    /// 增加暂停计数
    pub fn suspend_impl(&self) {
        self.suspend_count.fetch_add(1, Ordering::AcqRel);
    }

    /// 减少暂停计数
    pub fn resume_impl(&self) {
        let previous = self.suspend_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            crate::fatal!("resuming coroutine {} that was not suspended", self.name());
        }
    }

    /// 是否被全局暂停
    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspend_count.load(Ordering::Acquire) > 0
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("worker", &self.worker())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::stack::{page_size, Stack};
    use crate::runtime::StackfulCoroutineManager;
    use crate::value::FnMethod;

    fn native_noop(_: &StackfulCoroutineManager, _: &NativeParam) {}

    fn make_coroutine(entrypoint: Option<Entrypoint>) -> Arc<Coroutine> {
        let stack = Stack::new(page_size() * 4).unwrap();
        Coroutine::new(
            CoroutineId(7),
            "test_co",
            CoroutineType::Regular,
            CoroutineContext::new(Some(stack)),
            entrypoint,
            Some(Arc::new(CompletionEvent::new())),
        )
    }

    #[test]
    fn test_status_from_u8() {
        for status in [
            CoroutineStatus::Created,
            CoroutineStatus::Runnable,
            CoroutineStatus::Running,
            CoroutineStatus::Blocked,
            CoroutineStatus::Terminating,
            CoroutineStatus::Finished,
            CoroutineStatus::AwaitLoop,
        ] {
            assert_eq!(CoroutineStatus::from(status as u8), status);
        }
    }

    #[test]
    #[should_panic(expected = "invalid coroutine status byte 9")]
    fn test_invalid_status_byte_is_fatal() {
        let _ = CoroutineStatus::from(9);
    }

    #[test]
    fn test_managed_entrypoint() {
        let method = FnMethod::new("pkg.Main.work", |_: &StackfulCoroutineManager, args: &[Value]| {
            args[0].clone()
        });
        let co = make_coroutine(Some(Entrypoint::Managed {
            method,
            arguments: vec![Value::Int(5)],
        }));
        assert_eq!(co.id(), CoroutineId(7));
        assert!(co.has_managed_entrypoint());
        assert!(!co.has_native_entrypoint());
        assert_eq!(co.managed_entrypoint().unwrap().full_name(), "pkg.Main.work");
        assert_eq!(co.managed_entrypoint_arguments().unwrap(), vec![Value::Int(5)]);
        assert!(co.native_entrypoint().is_none());
        assert_eq!(co.status(), CoroutineStatus::Created);
    }

    #[test]
    fn test_native_entrypoint() {
        let param: NativeParam = Arc::new(17u32);
        let co = make_coroutine(Some(Entrypoint::Native {
            function: native_noop,
            param,
        }));
        assert!(co.has_native_entrypoint());
        assert!(co.managed_entrypoint().is_none());
        let param = co.native_entrypoint_param().unwrap();
        assert_eq!(param.downcast_ref::<u32>(), Some(&17));
    }

    #[test]
    fn test_request_completion() {
        let co = make_coroutine(None);
        let event = co.completion_event().unwrap();
        assert!(!event.happened());
        co.request_completion(Value::Int(3));
        assert!(event.happened());
        assert_eq!(event.result(), Some(Value::Int(3)));
    }

    #[test]
    fn test_clean_up_and_reinitialize() {
        let co = make_coroutine(Some(Entrypoint::Native {
            function: native_noop,
            param: Arc::new(()),
        }));
        co.clean_up();
        assert!(!co.has_entrypoint());
        assert!(co.completion_event().is_none());

        let method = FnMethod::new("again", |_: &StackfulCoroutineManager, _: &[Value]| {
            Value::Undefined
        });
        co.reinitialize(
            CoroutineId(99),
            "again",
            Entrypoint::Managed { method, arguments: Vec::new() },
            None,
        );
        assert_eq!(co.id(), CoroutineId(99));
        assert_eq!(co.name(), "again");
        assert!(co.has_managed_entrypoint());
    }

    #[test]
    fn test_suspend_count() {
        let co = make_coroutine(None);
        co.suspend_impl();
        co.suspend_impl();
        co.resume_impl();
        assert!(co.is_suspended());
        co.resume_impl();
        assert!(!co.is_suspended());
    }
}
