//! 上下文切换原语
//!
//! 整个子系统中唯一直接操作寄存器和栈指针的地方。对外只暴露：
//! - [`FiberRegisters`]：寄存器快照
//! - [`FiberRegisters::prepare`]：让快照在第一次被切入时从 `entry` 开始执行
//! - [`switch`]：保存当前寄存器到 `from`，恢复 `to` 并跳转
//! - [`remote_call`]：在另一个（挂起的）上下文的栈上执行一个闭包
//!
//! 只保存被调用者保存寄存器；调用者保存寄存器由 `clobber_abi("C")` 告知编译器。

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("qcoro supports only x86_64 and aarch64 targets");

// ============================================================================
// 寄存器布局
// ============================================================================

/// x86_64: rbx, rbp, r12, r13, r14, r15, rsp, rip
#[cfg(target_arch = "x86_64")]
mod layout {
    pub const SLOTS: usize = 8;
    pub const FRAME_POINTER: usize = 1;
    pub const STACK_POINTER: usize = 6;
    pub const PROGRAM_COUNTER: usize = 7;
}

/// aarch64: x19..x28, x29 (fp), x30 (lr), sp, pc, d8..d15
#[cfg(target_arch = "aarch64")]
mod layout {
    pub const SLOTS: usize = 22;
    pub const FRAME_POINTER: usize = 10;
    pub const LINK_REGISTER: usize = 11;
    pub const STACK_POINTER: usize = 12;
    pub const PROGRAM_COUNTER: usize = 13;
}

/// 在远程调用时预留给目标栈顶之下的空间（跳过红区）
const REMOTE_CALL_RESERVE: usize = 256;

/// 寄存器快照
#[repr(C)]
#[derive(Debug, Clone)]
pub struct FiberRegisters {
    regs: [u64; layout::SLOTS],
}

impl FiberRegisters {
    /// 创建空快照
    ///
    /// 空快照只能作为 [`switch`] 的 `from` 使用；第一次切出时会被填满。
    pub const fn new() -> Self {
        Self { regs: [0; layout::SLOTS] }
    }

    /// 准备入口
    ///
    /// 第一次切入这个快照时，会在 `stack_top` 之下的新栈上调用 `entry`。
    ///
    /// # Safety
    ///
    /// `stack_top` 必须指向一块可写栈内存的末尾，且下方至少有 16 字节可用。
    pub unsafe fn prepare(&mut self, stack_top: *mut u8, entry: extern "C" fn() -> !) {
        let top = (stack_top as usize) & !15;
        self.regs = [0; layout::SLOTS];

        #[cfg(target_arch = "x86_64")]
        {
            // 模拟 call 指令压入的返回地址：入口处 rsp % 16 == 8
            let sp = top - 8;
            // SAFETY: 调用方保证 sp 在栈内
            unsafe { (sp as *mut u64).write(0) };
            self.regs[layout::STACK_POINTER] = sp as u64;
        }

        #[cfg(target_arch = "aarch64")]
        {
            self.regs[layout::STACK_POINTER] = top as u64;
            self.regs[layout::LINK_REGISTER] = 0;
        }

        self.regs[layout::FRAME_POINTER] = 0;
        self.regs[layout::PROGRAM_COUNTER] = entry as usize as u64;
    }

    /// 保存的栈指针
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.regs[layout::STACK_POINTER] as usize
    }

    /// 保存的程序计数器
    #[inline]
    pub fn program_counter(&self) -> usize {
        self.regs[layout::PROGRAM_COUNTER] as usize
    }

    /// 快照是否已经保存过（或准备过）执行状态
    #[inline]
    pub fn is_captured(&self) -> bool {
        self.program_counter() != 0
    }
}

impl Default for FiberRegisters {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 切换
// ============================================================================

/// 切换上下文
///
/// 把当前执行状态保存到 `from`，恢复 `to` 并跳转过去。只有当之后某个上下文
/// 再切回 `from` 时，这个调用才会返回。
///
/// # Safety
///
/// - `from` 可写，`to` 已经被捕获或准备过
/// - `to` 引用的栈必须仍然有效，且没有在其他线程上执行
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub unsafe fn switch(from: *mut FiberRegisters, to: *const FiberRegisters) {
    // SAFETY: 调用方保证指针有效；rbx/rbp/r12-r15/rsp 在切回时恢复为进入时的值
    unsafe {
        std::arch::asm!(
            "mov [rdi + 0x00], rbx",
            "mov [rdi + 0x08], rbp",
            "mov [rdi + 0x10], r12",
            "mov [rdi + 0x18], r13",
            "mov [rdi + 0x20], r14",
            "mov [rdi + 0x28], r15",
            "mov [rdi + 0x30], rsp",
            "lea rax, [rip + 2f]",
            "mov [rdi + 0x38], rax",
            "mov rbx, [rsi + 0x00]",
            "mov rbp, [rsi + 0x08]",
            "mov r12, [rsi + 0x10]",
            "mov r13, [rsi + 0x18]",
            "mov r14, [rsi + 0x20]",
            "mov r15, [rsi + 0x28]",
            "mov rsp, [rsi + 0x30]",
            "jmp qword ptr [rsi + 0x38]",
            "2:",
            in("rdi") from,
            in("rsi") to,
            clobber_abi("C"),
        );
    }
}

/// 切换上下文（aarch64）
///
/// # Safety
///
/// 同 x86_64 版本。
#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub unsafe fn switch(from: *mut FiberRegisters, to: *const FiberRegisters) {
    // SAFETY: 调用方保证指针有效；x19-x30/sp/d8-d15 在切回时恢复为进入时的值
    unsafe {
        std::arch::asm!(
            "mov x9, sp",
            "stp x19, x20, [x0, #0]",
            "stp x21, x22, [x0, #16]",
            "stp x23, x24, [x0, #32]",
            "stp x25, x26, [x0, #48]",
            "stp x27, x28, [x0, #64]",
            "stp x29, x30, [x0, #80]",
            "adr x10, 2f",
            "stp x9, x10, [x0, #96]",
            "stp d8, d9, [x0, #112]",
            "stp d10, d11, [x0, #128]",
            "stp d12, d13, [x0, #144]",
            "stp d14, d15, [x0, #160]",
            "ldp x19, x20, [x1, #0]",
            "ldp x21, x22, [x1, #16]",
            "ldp x23, x24, [x1, #32]",
            "ldp x25, x26, [x1, #48]",
            "ldp x27, x28, [x1, #64]",
            "ldp x29, x30, [x1, #80]",
            "ldp x9, x10, [x1, #96]",
            "ldp d8, d9, [x1, #112]",
            "ldp d10, d11, [x1, #128]",
            "ldp d12, d13, [x1, #144]",
            "ldp d14, d15, [x1, #160]",
            "mov sp, x9",
            "br x10",
            "2:",
            in("x0") from,
            in("x1") to,
            clobber_abi("C"),
        );
    }
}

// ============================================================================
// 远程调用
// ============================================================================

/// 远程调用帧，位于发起方的栈上
struct RemoteCallFrame {
    call: unsafe fn(*mut ()),
    data: *mut (),
    caller: FiberRegisters,
    proxy: FiberRegisters,
    panic: Option<Box<dyn Any + Send>>,
}

thread_local! {
    /// 当前线程正在进行的远程调用
    static REMOTE_CALL_FRAME: Cell<*mut RemoteCallFrame> = const { Cell::new(ptr::null_mut()) };
}

unsafe fn call_once_shim<F: FnOnce()>(data: *mut ()) {
    // SAFETY: data 指向 remote_call 栈上的 Option<F>
    let slot = unsafe { &mut *data.cast::<Option<F>>() };
    if let Some(f) = slot.take() {
        f();
    }
}

extern "C" fn remote_call_proxy() -> ! {
    let frame = REMOTE_CALL_FRAME.with(Cell::get);
    // SAFETY: remote_call 在切换前设置了帧指针，且帧在调用返回前一直有效
    unsafe {
        let call = (*frame).call;
        let data = (*frame).data;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| call(data))) {
            (*frame).panic = Some(payload);
        }
        let mut scratch = FiberRegisters::new();
        switch(&mut scratch, ptr::addr_of!((*frame).caller));
    }
    // 代理上下文不会再被切回
    std::process::abort()
}

/// 在 `target` 的栈上执行 `f`
///
/// 复制 `target` 的快照，把入口改为代理跳板，切过去执行 `f` 后再切回来。
/// `target` 自身的快照不会被修改。`f` 中的 panic 会在调用方重新抛出。
///
/// # Safety
///
/// `target` 必须是一个已挂起的上下文，并且在调用期间不会被任何线程恢复执行。
pub unsafe fn remote_call<F: FnOnce()>(target: &FiberRegisters, f: F) {
    let mut slot = Some(f);
    let mut frame = RemoteCallFrame {
        call: call_once_shim::<F>,
        data: ptr::addr_of_mut!(slot).cast::<()>(),
        caller: FiberRegisters::new(),
        proxy: target.clone(),
        panic: None,
    };
    let frame_ptr: *mut RemoteCallFrame = &mut frame;

    let sp = target.stack_pointer() - REMOTE_CALL_RESERVE;
    // SAFETY: 目标已挂起，其栈指针以下的空间未被使用
    unsafe {
        (*frame_ptr).proxy.prepare(sp as *mut u8, remote_call_proxy);
    }

    let previous = REMOTE_CALL_FRAME.with(|c| c.replace(frame_ptr));
    // SAFETY: proxy 刚刚准备好，caller 位于当前栈帧内
    unsafe {
        switch(ptr::addr_of_mut!((*frame_ptr).caller), ptr::addr_of!((*frame_ptr).proxy));
    }
    REMOTE_CALL_FRAME.with(|c| c.set(previous));

    // SAFETY: 代理已经切回，帧不再被其他上下文访问
    if let Some(payload) = unsafe { (*frame_ptr).panic.take() } {
        panic::resume_unwind(payload);
    }
}
