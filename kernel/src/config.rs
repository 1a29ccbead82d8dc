//! Process subsystem configuration constants.
//!
//! Compile-time limits for the process table, per-CPU state and the
//! user/kernel memory layout. The table and CPU arrays are sized from
//! these values.

/// Maximum number of CPUs supported.
pub const NCPU: usize = 8;

/// Maximum number of process-table entries (processes and threads).
pub const NPROC: usize = 64;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Number of signal slots per process (signal 0 is unused).
pub const NSIG: usize = 32;

/// Length of the diagnostic name, in bytes.
pub const PROC_NAME_LEN: usize = 16;

/// Page size (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Kernel stack size per process (one page).
pub const KSTACK_SIZE: usize = PAGE_SIZE;

/// Size of the user-supplied stack handed to `clone`.
pub const THREAD_STACK_SIZE: usize = PAGE_SIZE;

/// First kernel virtual address. User addresses lie strictly below.
pub const KERNBASE: usize = 0x8000_0000;

/// User code segment selector (GDT index 4, RPL 3).
pub const USER_CS: u64 = 0x23;

/// User data segment selector (GDT index 3, RPL 3).
pub const USER_DS: u64 = 0x1B;

/// Initial user RFLAGS: interrupts enabled plus the always-one bit.
pub const USER_RFLAGS: u64 = 0x202;

/// Round `addr` up to the next page boundary.
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round `addr` down to its page boundary.
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}
