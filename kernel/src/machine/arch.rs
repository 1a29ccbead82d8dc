//! CPU-level primitives: identity, interrupt flag, context switch.

/// Per-CPU hardware operations.
///
/// `Context` is the saved kernel register set of one execution context.
/// Exactly one exists per process-table entry and one per CPU for the
/// scheduler loop.
pub trait Arch {
    type Context: Send;

    /// Index of the executing CPU, `< NCPU`. Only stable while interrupts
    /// are disabled.
    fn cpu_id(&self) -> usize;

    fn intr_enable(&self);
    fn intr_disable(&self);
    fn intr_enabled(&self) -> bool;

    /// Faulting linear address of the most recent page fault on this CPU.
    fn fault_address(&self) -> usize;

    /// Context slot for a CPU's scheduler loop. Filled by the first
    /// `switch` that saves into it.
    fn scheduler_context(&self) -> Self::Context;

    /// Context that, when switched to, runs the platform's first-run
    /// entry on the kernel stack ending at `stack_top`. That entry must
    /// call [`crate::Kernel::forkret`] and then return to user mode
    /// through the trap frame sitting above `stack_top`.
    fn first_run_context(&self, stack_top: usize) -> Self::Context;

    /// Save the current kernel registers into `save` and resume `load`.
    /// Returns when some other context switches back into `save`.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for the duration of the suspension and
    /// `load` must hold a context produced by this trait.
    unsafe fn switch(&self, save: *mut Self::Context, load: *const Self::Context);
}
