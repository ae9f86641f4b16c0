//! 托管值与托管方法
//!
//! 协程的托管入口由字节码分发器提供，这里只定义调度器需要的最小接口：
//! 参数/返回值的表示，以及"可以被调用的方法"。

use std::fmt;
use std::sync::Arc;

use crate::runtime::StackfulCoroutineManager;

/// 托管值
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// 未定义（协程没有返回值时的结果）
    #[default]
    Undefined,
    /// 空引用
    Null,
    /// 布尔值
    Bool(bool),
    /// 整数
    Int(i64),
    /// 浮点数
    Float(f64),
    /// 字符串
    String(Arc<str>),
    /// 堆对象引用（由 GC 管理，这里只保存句柄）
    Object(u64),
}

impl Value {
    /// 取整数值
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// 取字符串
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Arc::from(v))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Object(h) => write!(f, "<object {:#x}>", h),
        }
    }
}

/// 托管方法
///
/// 协程的托管入口。`invoke` 在协程自己的栈上执行，可以通过 `manager`
/// 调用 `schedule`/`await_event` 等挂起点。
pub trait ManagedMethod: Send + Sync {
    /// 方法全名（用作协程名）
    fn full_name(&self) -> String;

    /// 执行方法
    fn invoke(&self, manager: &StackfulCoroutineManager, args: &[Value]) -> Value;
}

/// 由闭包实现的托管方法
pub struct FnMethod<F> {
    name: String,
    body: F,
}

impl<F> FnMethod<F>
where
    F: Fn(&StackfulCoroutineManager, &[Value]) -> Value + Send + Sync + 'static,
{
    /// 创建方法
    pub fn new(name: impl Into<String>, body: F) -> Arc<Self> {
        Arc::new(Self { name: name.into(), body })
    }
}

impl<F> ManagedMethod for FnMethod<F>
where
    F: Fn(&StackfulCoroutineManager, &[Value]) -> Value + Send + Sync + 'static,
{
    fn full_name(&self) -> String {
        self.name.clone()
    }

    fn invoke(&self, manager: &StackfulCoroutineManager, args: &[Value]) -> Value {
        (self.body)(manager, args)
    }
}

impl<F> fmt::Debug for FnMethod<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMethod").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::from(42).as_int(), Some(42));
        assert_eq!(Value::from("co").as_str(), Some("co"));
        assert_eq!(Value::Null.as_int(), None);
        assert_eq!(Value::default(), Value::Undefined);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Int(-3).to_string(), "-3");
        assert_eq!(Value::Object(255).to_string(), "<object 0xff>");
        assert_eq!(Value::Undefined.to_string(), "undefined");
    }
}
