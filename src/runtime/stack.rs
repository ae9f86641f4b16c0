//! 协程栈管理
//!
//! 每个协程栈是一段独立的 mmap 匿名映射，最低地址处是一页 `PROT_NONE` 保护页，
//! 栈溢出会触发段错误而不是悄悄破坏相邻内存。

use std::ptr::NonNull;

use crate::error::StackError;

/// 栈信息（供 GC 和栈溢出检查使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInfo {
    /// 可用区域最低地址
    pub lo: usize,
    /// 可用区域大小（字节）
    pub size: usize,
}

impl StackInfo {
    /// 可用区域最高地址（不含）
    #[inline]
    pub fn hi(&self) -> usize {
        self.lo + self.size
    }

    /// 地址是否落在栈内
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.lo && addr < self.hi()
    }
}

/// 获取系统页大小
pub fn page_size() -> usize {
    // SAFETY: sysconf 没有前置条件
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// 协程栈
///
/// 由 manager 分配，交给协程上下文持有；上下文被销毁时栈随之释放。
pub struct Stack {
    /// 映射起始地址（保护页从这里开始）
    base: NonNull<u8>,
    /// 映射总大小（保护页 + 可用区域）
    mapping_size: usize,
    /// 保护页大小
    guard_size: usize,
}

impl Stack {
    /// 栈对齐：16 字节
    pub const ALIGNMENT: usize = 16;

    /// 分配指定可用大小的栈
    ///
    /// `size` 必须是页大小的整数倍。
    pub fn new(size: usize) -> Result<Self, StackError> {
        let page_size = page_size();
        if size == 0 || size % page_size != 0 {
            return Err(StackError::Misaligned { size, page_size });
        }
        let mapping_size = size + page_size;

        // SAFETY: 匿名私有映射，fd = -1，offset = 0
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::Map(std::io::Error::last_os_error()));
        }

        // SAFETY: base 是刚映射的地址，保护页在映射范围内
        if unsafe { libc::mprotect(base, page_size, libc::PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: 与上面的 mmap 参数一致
            unsafe { libc::munmap(base, mapping_size) };
            return Err(StackError::Protect(err));
        }

        let base = NonNull::new(base.cast::<u8>()).ok_or_else(|| {
            StackError::Map(std::io::Error::new(std::io::ErrorKind::Other, "mmap returned null"))
        })?;

        Ok(Self {
            base,
            mapping_size,
            guard_size: page_size,
        })
    }

    /// 可用区域最低地址
    #[inline]
    pub fn lo(&self) -> *mut u8 {
        // SAFETY: guard_size 在映射范围内
        unsafe { self.base.as_ptr().add(self.guard_size) }
    }

    /// 栈顶（最高地址，不含），栈从这里向低地址增长
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // SAFETY: 指向映射末尾之后一个字节，只用于地址计算
        unsafe { self.base.as_ptr().add(self.mapping_size) }
    }

    /// 可用区域大小
    #[inline]
    pub fn size(&self) -> usize {
        self.mapping_size - self.guard_size
    }

    /// 栈信息
    #[inline]
    pub fn info(&self) -> StackInfo {
        StackInfo {
            lo: self.lo() as usize,
            size: self.size(),
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: base 和 mapping_size 对应一次尚未释放的 mmap
        unsafe {
            libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.mapping_size);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("lo", &self.lo())
            .field("size", &self.size())
            .finish()
    }
}

// SAFETY: 栈内存由 Stack 独占，同一时刻只有一个线程在上面执行
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_new() {
        let size = page_size() * 4;
        let stack = Stack::new(size).unwrap();
        assert_eq!(stack.size(), size);
        assert_eq!(stack.top() as usize - stack.lo() as usize, size);
        assert_eq!(stack.top() as usize % Stack::ALIGNMENT, 0);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(page_size()).unwrap();
        // SAFETY: 写入可用区域的第一个和最后一个字节
        unsafe {
            stack.lo().write(0xAB);
            stack.top().sub(1).write(0xCD);
            assert_eq!(stack.lo().read(), 0xAB);
        }
    }

    #[test]
    fn test_stack_misaligned_size() {
        let err = Stack::new(page_size() + 1).unwrap_err();
        assert!(matches!(err, StackError::Misaligned { .. }));
        assert!(Stack::new(0).is_err());
    }

    #[test]
    fn test_stack_info_contains() {
        let stack = Stack::new(page_size() * 2).unwrap();
        let info = stack.info();
        assert!(info.contains(info.lo));
        assert!(info.contains(info.hi() - 1));
        assert!(!info.contains(info.hi()));
        assert!(!info.contains(info.lo - 1));
    }
}
