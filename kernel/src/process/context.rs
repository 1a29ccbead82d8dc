//! Process Context
//!
//! Saved user-mode registers and the kernel stack that holds them.

use core::mem::size_of;

use crate::config::{KSTACK_SIZE, PAGE_SIZE, USER_CS, USER_DS, USER_RFLAGS};
use crate::machine::Page;

/// User register state saved on kernel entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    // General purpose registers (callee-saved first)
    /// R15 register
    pub r15: u64,
    /// R14 register
    pub r14: u64,
    /// R13 register
    pub r13: u64,
    /// R12 register
    pub r12: u64,
    /// RBX register
    pub rbx: u64,
    /// RBP register (frame pointer)
    pub rbp: u64,

    // Caller-saved registers
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    /// First argument register
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    /// Return-value register
    pub rax: u64,

    // Segment registers
    pub ds: u64,
    pub es: u64,

    // Interrupt frame (pushed by CPU on interrupt/syscall)
    /// User resume address
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    /// User stack pointer
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Frame for the first user instruction of the init process: resume
    /// at address 0 with the stack at the top of its single page.
    pub fn initial_user() -> Self {
        TrapFrame {
            cs: USER_CS,
            ds: USER_DS,
            es: USER_DS,
            ss: USER_DS,
            rflags: USER_RFLAGS,
            rsp: PAGE_SIZE as u64,
            rip: 0,
            ..Default::default()
        }
    }
}

/// One page of kernel stack. The trap frame sits at the very top; the
/// first-run context is built directly below it.
pub struct KernelStack {
    page: Page,
}

impl KernelStack {
    pub fn new(page: Page) -> Self {
        let stack = KernelStack { page };
        // SAFETY: the page is ours and the frame lies within it, aligned.
        unsafe { stack.trap_frame_ptr().write(TrapFrame::default()) };
        stack
    }

    fn trap_frame_ptr(&self) -> *mut TrapFrame {
        (self.page.addr() + KSTACK_SIZE - size_of::<TrapFrame>()) as *mut TrapFrame
    }

    /// Highest address usable for kernel stack frames.
    pub fn context_top(&self) -> usize {
        self.trap_frame_ptr() as usize
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        // SAFETY: initialized in `new`; borrows follow `self`.
        unsafe { &*self.trap_frame_ptr() }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: as above, and `&mut self` makes the borrow unique.
        unsafe { &mut *self.trap_frame_ptr() }
    }

    pub fn into_page(self) -> Page {
        self.page
    }
}
